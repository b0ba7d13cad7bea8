//! Layered configuration resolution.
//!
//! Layers apply in order: built-in defaults, the config file, environment
//! variables, then explicit overrides. Resolution happens once when a build
//! starts; stages never read the environment themselves.

use super::BuildConfig;
use crate::errors::ConfigError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides the publication directory.
pub const SERVER_BASE_PATH_ENV: &str = "HIVEFORGE_SERVER_BASE_PATH";

/// Overrides the public download URL base.
pub const DOWNLOAD_URL_BASE_ENV: &str = "HIVEFORGE_DOWNLOAD_URL_BASE";

/// Source of environment variables.
pub trait EnvSource {
    /// Looks up a variable; empty values count as unset.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }
}

/// Explicit values that win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Hive identifier.
    pub hive_id: Option<String>,
    /// Image version.
    pub version: Option<String>,
    /// Skip validation.
    pub skip_validation: Option<bool>,
    /// Publication directory.
    pub server_base_path: Option<PathBuf>,
    /// Download URL base.
    pub download_url_base: Option<String>,
}

impl BuildConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parses a JSON document.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Loads a config file; `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        debug!(path = %path.display(), json = is_json, "Parsing build config");

        if is_json {
            Self::from_json_str(&source)
        } else {
            Self::from_yaml_str(&source)
        }
    }

    /// Applies the environment layer.
    #[must_use]
    pub fn with_env(mut self, env: &impl EnvSource) -> Self {
        if let Some(path) = env.get(SERVER_BASE_PATH_ENV) {
            debug!(var = SERVER_BASE_PATH_ENV, value = %path, "Environment override");
            self.publication.server_base_path = Some(PathBuf::from(path));
        }
        if let Some(url) = env.get(DOWNLOAD_URL_BASE_ENV) {
            debug!(var = DOWNLOAD_URL_BASE_ENV, value = %url, "Environment override");
            self.publication.download_url_base = Some(url);
        }
        self
    }

    /// Applies explicit overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(id) = overrides.hive_id {
            self.hive.id = id;
        }
        if let Some(version) = overrides.version {
            self.hive.version = version;
        }
        if let Some(skip) = overrides.skip_validation {
            self.build.skip_validation = skip;
        }
        if let Some(path) = overrides.server_base_path {
            self.publication.server_base_path = Some(path);
        }
        if let Some(url) = overrides.download_url_base {
            self.publication.download_url_base = Some(url);
        }
        self
    }

    /// Resolves every layer and validates the result.
    pub fn resolve(
        path: Option<&Path>,
        env: &impl EnvSource,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };

        let config = base.with_env(env).with_overrides(overrides);
        config.validate()?;

        info!(
            hive_id = %config.hive.id,
            version = %config.hive.version,
            artifact_type = %config.build.artifact_type,
            "Resolved build configuration"
        );
        Ok(config)
    }
}
