//! Error types for the hiveforge build pipeline.
//!
//! Every failure a stage can run into maps onto one [`ErrorCategory`]. Stages
//! convert these errors into a boolean result before they reach the
//! orchestrator, so the categories mostly drive log messages.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type BuildResult<T> = Result<T, BuildError>;

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Network or download failures.
    Transport,
    /// Image manipulation failures (extract, mount, compress, copy).
    Build,
    /// The image did not pass structural or content checks.
    Validation,
    /// Missing or invalid configuration or pipeline state.
    Configuration,
    /// The build was cancelled.
    Cancelled,
    /// Anything not anticipated.
    Unexpected,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Build => write!(f, "build"),
            Self::Validation => write!(f, "validation"),
            Self::Configuration => write!(f, "configuration"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unexpected => write!(f, "unexpected"),
        }
    }
}

/// The main error type for build operations.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A network transfer failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An image manipulation step failed.
    #[error("Image build error: {0}")]
    Build(String),

    /// The image failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage needed a pipeline state value that an earlier stage never wrote.
    #[error("Pipeline state is missing '{key}'")]
    MissingState {
        /// The state key that was absent.
        key: &'static str,
    },

    /// The circuit breaker guarding a stage is open.
    #[error("Circuit breaker for stage '{stage}' is open; retry in {retry_in:?}")]
    CircuitOpen {
        /// The guarded stage.
        stage: String,
        /// Time left until a trial call is allowed.
        retry_in: Duration,
    },

    /// An external command exited unsuccessfully.
    #[error("Command '{command}' failed with status {status}: {stderr}")]
    Command {
        /// The program and arguments that were run.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A file the pipeline expected was not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The build was cancelled.
    #[error("Build cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl BuildError {
    /// Returns the category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Build(_) | Self::Command { .. } | Self::FileNotFound(_) | Self::Io(_) => {
                ErrorCategory::Build
            }
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Configuration(_) | Self::MissingState { .. } | Self::CircuitOpen { .. } => {
                ErrorCategory::Configuration
            }
            Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::Serialization(_) | Self::Unexpected(_) => ErrorCategory::Unexpected,
        }
    }

    /// Returns true if this is the fail-fast signal of an open circuit breaker.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for BuildError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors raised while loading and resolving build configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        /// The file that was read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML document was malformed.
    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The JSON document was malformed.
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// A value failed validation.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for BuildError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
