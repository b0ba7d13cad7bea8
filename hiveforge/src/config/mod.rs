//! Build configuration.
//!
//! A [`BuildConfig`] is resolved exactly once per build (see [`loader`]) and
//! then shared read-only with every stage through the pipeline state.

mod loader;

pub use loader::{
    ConfigOverrides, EnvSource, ProcessEnv, DOWNLOAD_URL_BASE_ENV, SERVER_BASE_PATH_ENV,
};

use crate::image::ChecksumKind;
use crate::pipeline::{ArtifactType, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Default directory published images are copied into.
pub const DEFAULT_SERVER_BASE_PATH: &str = "/var/www/html/images";

/// Default public URL the server directory is reachable under.
pub const DEFAULT_DOWNLOAD_URL_BASE: &str = "http://localhost/images/";

/// Boot partition start on Raspberry Pi OS images (sector 8192).
pub const DEFAULT_BOOT_OFFSET: u64 = 8192 * 512;

/// Root partition start on Raspberry Pi OS images (sector 532480).
pub const DEFAULT_ROOT_OFFSET: u64 = 532_480 * 512;

/// Top-level build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Identity of the device the image is built for.
    #[serde(default)]
    pub hive: HiveConfig,
    /// Base operating-system image.
    #[serde(default)]
    pub base_image: BaseImageConfig,
    /// System customization, including credentials.
    #[serde(default)]
    pub system: SystemConfig,
    /// Software to enable in the image.
    #[serde(default)]
    pub software: SoftwareConfig,
    /// Pipeline behaviour.
    #[serde(default)]
    pub build: BuildSettings,
    /// Where finished images are published.
    #[serde(default)]
    pub publication: PublicationConfig,
}

impl BuildConfig {
    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), crate::errors::ConfigError> {
        use crate::errors::ConfigError;

        check_name_component("hive.id", &self.hive.id)?;
        check_name_component("hive.version", &self.hive.version)?;
        if self.base_image.url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_image.url must not be empty".into()));
        }
        if self.build.boot_offset == self.build.root_offset {
            return Err(ConfigError::Invalid(
                "build.boot_offset and build.root_offset must differ".into(),
            ));
        }
        self.build
            .circuit_breaker
            .validate()
            .map_err(ConfigError::Invalid)
    }
}

/// Rejects values that cannot be used verbatim as a single file-name
/// component: `hive.id` and `hive.version` end up in artifact and directory
/// names.
fn check_name_component(field: &str, value: &str) -> Result<(), crate::errors::ConfigError> {
    use crate::errors::ConfigError;

    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(ConfigError::Invalid(format!("{field} must not be {value:?}")));
    }
    if let Some(bad) = value
        .chars()
        .find(|&c| matches!(c, '/' | '\\') || c.is_control() || c.is_whitespace())
    {
        return Err(ConfigError::Invalid(format!(
            "{field} contains {bad:?}, which is not allowed in a file name"
        )));
    }
    Ok(())
}

/// Device identity stamped into the image and its artifact names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveConfig {
    /// Hive/device identifier.
    #[serde(default = "default_hive_id")]
    pub id: String,
    /// Image version.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_hive_id() -> String {
    "hive".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            id: default_hive_id(),
            version: default_version(),
        }
    }
}

/// The compressed base image the build starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseImageConfig {
    /// Download URL; `{version}` is replaced by [`Self::version`].
    #[serde(default = "default_base_url")]
    pub url: String,
    /// Release of the base image.
    #[serde(default = "default_base_version")]
    pub version: String,
    /// Expected hex digest of the compressed download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Algorithm of [`Self::checksum`].
    #[serde(default)]
    pub checksum_type: ChecksumKind,
}

fn default_base_url() -> String {
    concat!(
        "https://downloads.raspberrypi.com/raspios_lite_arm64/images/",
        "raspios_lite_arm64-{version}/{version}-raspios-bookworm-arm64-lite.img.xz"
    )
    .to_string()
}

fn default_base_version() -> String {
    "2024-11-19".to_string()
}

impl Default for BaseImageConfig {
    fn default() -> Self {
        Self {
            url: default_base_url(),
            version: default_base_version(),
            checksum: None,
            checksum_type: ChecksumKind::default(),
        }
    }
}

impl BaseImageConfig {
    /// Returns the download URL with the version substituted.
    #[must_use]
    pub fn resolved_url(&self) -> String {
        self.url.replace("{version}", &self.version)
    }

    /// Returns the file name of the download.
    #[must_use]
    pub fn file_name(&self) -> String {
        let url = self.resolved_url();
        let trimmed = url.split(['?', '#']).next().unwrap_or_default();
        trimmed
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map_or_else(|| "base-image.img.xz".to_string(), str::to_string)
    }
}

/// System customization applied during provisioning.
///
/// `ssh_private_key` and `ssh_password` are secrets and never leave the
/// build host; see [`crate::artifact::FilteredConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Hostname written to `/etc/hostname`. Defaults to `hive-<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Login user whose `authorized_keys` receives the public key.
    #[serde(default = "default_user")]
    pub user: String,
    /// Whether to enable the SSH daemon on first boot.
    #[serde(default)]
    pub enable_ssh: bool,
    /// Public key installed for [`Self::user`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Private key used by the fleet tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
    /// Password for [`Self::user`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    /// Timezone name, e.g. `Europe/Berlin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

fn default_user() -> String {
    "pi".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            user: default_user(),
            enable_ssh: false,
            ssh_public_key: None,
            ssh_private_key: None,
            ssh_password: None,
            timezone: None,
        }
    }
}

/// Software configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareConfig {
    /// Packages expected in the image.
    #[serde(default)]
    pub packages: Vec<String>,
    /// systemd units that must be installed.
    #[serde(default)]
    pub services: Vec<String>,
}

/// Pipeline behaviour knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Which stages run.
    #[serde(default)]
    pub artifact_type: ArtifactType,
    /// Scratch directory for raw images and mount points.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Where downloads are cached between builds.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// A previously unpacked image (`boot/` and `rootfs/`) to reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_unpacked_path: Option<PathBuf>,
    /// Byte offset of the boot partition inside the raw image.
    #[serde(default = "default_boot_offset")]
    pub boot_offset: u64,
    /// Byte offset of the root partition inside the raw image.
    #[serde(default = "default_root_offset")]
    pub root_offset: u64,
    /// Skip the validation stage entirely.
    #[serde(default)]
    pub skip_validation: bool,
    /// Validation categories to run.
    #[serde(default = "default_validation_categories")]
    pub validation_categories: BTreeSet<String>,
    /// Files (relative to the root partition) that must exist.
    #[serde(default = "default_required_files")]
    pub required_files: Vec<String>,
    /// Unmount partitions left mounted by an aborted build.
    #[serde(default = "default_unmount_on_abort")]
    pub unmount_on_abort: bool,
    /// Per-stage circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_boot_offset() -> u64 {
    DEFAULT_BOOT_OFFSET
}

fn default_root_offset() -> u64 {
    DEFAULT_ROOT_OFFSET
}

fn default_validation_categories() -> BTreeSet<String> {
    ["structure", "files", "services"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_required_files() -> Vec<String> {
    vec!["etc/fstab".to_string(), "etc/passwd".to_string()]
}

fn default_unmount_on_abort() -> bool {
    true
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            artifact_type: ArtifactType::default(),
            work_dir: default_work_dir(),
            cache_dir: default_cache_dir(),
            cached_unpacked_path: None,
            boot_offset: default_boot_offset(),
            root_offset: default_root_offset(),
            skip_validation: false,
            validation_categories: default_validation_categories(),
            required_files: default_required_files(),
            unmount_on_abort: default_unmount_on_abort(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Publication target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicationConfig {
    /// Directory served by the image server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_base_path: Option<PathBuf>,
    /// Public URL of [`Self::server_base_path`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url_base: Option<String>,
}

impl PublicationConfig {
    /// Returns the configured server directory or the default.
    #[must_use]
    pub fn server_base_path(&self) -> PathBuf {
        self.server_base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_BASE_PATH))
    }

    /// Returns the download URL base, always ending in exactly one `/`.
    #[must_use]
    pub fn download_url_base(&self) -> String {
        let base = self
            .download_url_base
            .as_deref()
            .unwrap_or(DEFAULT_DOWNLOAD_URL_BASE);
        format!("{}/", base.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BuildConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.build.boot_offset, 4_194_304);
        assert_eq!(config.build.root_offset, 272_629_760);
        assert!(config.build.unmount_on_abort);
        assert!(config.build.validation_categories.contains("structure"));
    }

    #[test]
    fn test_resolved_url_and_file_name() {
        let base = BaseImageConfig {
            url: "https://example.com/images/{version}/os-{version}.img.xz?dl=1".into(),
            version: "2024-11-19".into(),
            checksum: None,
            checksum_type: ChecksumKind::Sha256,
        };
        assert_eq!(
            base.resolved_url(),
            "https://example.com/images/2024-11-19/os-2024-11-19.img.xz?dl=1"
        );
        assert_eq!(base.file_name(), "os-2024-11-19.img.xz");
    }

    #[test]
    fn test_download_url_base_normalized() {
        let mut publication = PublicationConfig::default();
        assert_eq!(publication.download_url_base(), DEFAULT_DOWNLOAD_URL_BASE);

        publication.download_url_base = Some("https://img.example.com/hives".into());
        assert_eq!(publication.download_url_base(), "https://img.example.com/hives/");

        publication.download_url_base = Some("https://img.example.com/hives//".into());
        assert_eq!(publication.download_url_base(), "https://img.example.com/hives/");
    }

    #[test]
    fn test_validate_rejects_empty_hive_id() {
        let mut config = BuildConfig::default();
        config.hive.id = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = BuildConfig::default();
        config.build.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_user_matches_serde_default() {
        assert_eq!(BuildConfig::default().system.user, "pi");
        assert_eq!(SystemConfig::default().user, "pi");

        let parsed: BuildConfig = serde_yaml::from_str("hive:\n  id: h1\n").unwrap();
        assert_eq!(parsed.system.user, "pi");
        let parsed: BuildConfig =
            serde_yaml::from_str("system:\n  enable_ssh: true\n").unwrap();
        assert_eq!(parsed.system.user, "pi");
    }

    #[test]
    fn test_validate_rejects_path_like_hive_names() {
        for bad in ["../escaped", "a/b", "a\\b", "..", ".", "two words", "tab\t"] {
            let mut config = BuildConfig::default();
            config.hive.id = bad.into();
            assert!(config.validate().is_err(), "hive.id {bad:?} accepted");

            let mut config = BuildConfig::default();
            config.hive.version = bad.into();
            assert!(config.validate().is_err(), "hive.version {bad:?} accepted");
        }
    }

    #[test]
    fn test_validate_accepts_dotted_names() {
        let mut config = BuildConfig::default();
        config.hive.id = "hive-01.lab".into();
        config.hive.version = "1.2.3-rc1".into();
        assert!(config.validate().is_ok());
    }
}
