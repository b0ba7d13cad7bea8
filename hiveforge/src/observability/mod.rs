//! Logging setup.
//!
//! Library code only emits `tracing` events. Binaries call [`init_logging`]
//! once to install a subscriber.

use crate::config::EnvSource;
use tracing_subscriber::EnvFilter;

/// Log filter directive, e.g. `hiveforge=debug`.
pub const LOG_FILTER_ENV: &str = "HIVEFORGE_LOG";

/// Set to `json` for JSON log lines.
pub const LOG_FORMAT_ENV: &str = "HIVEFORGE_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive.
    pub filter: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Reads [`LOG_FILTER_ENV`] and [`LOG_FORMAT_ENV`].
    #[must_use]
    pub fn from_env(env: &impl EnvSource) -> Self {
        let format = match env.get(LOG_FORMAT_ENV) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Self {
            filter: env
                .get(LOG_FILTER_ENV)
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format,
        }
    }
}

/// Installs the global subscriber.
///
/// An unparsable filter falls back to `info`. Returns an error if a
/// subscriber was already installed.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
