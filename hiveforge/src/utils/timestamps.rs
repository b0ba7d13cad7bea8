//! Timestamp formatting.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Format of the timestamp prefix on published artifact names.
pub const PUBLISH_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
///
/// # Examples
///
/// ```
/// use hiveforge::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Formats a timestamp as ISO 8601 string.
#[must_use]
pub fn format_iso8601(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Formats `dt` as the `YYYY-MM-DD_HH-MM` prefix of published file names.
#[must_use]
pub fn publish_stamp<Tz: TimeZone>(dt: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    dt.format(PUBLISH_STAMP_FORMAT).to_string()
}

/// Publish stamp for the current local time.
#[must_use]
pub fn local_publish_stamp() -> String {
    publish_stamp(&Local::now())
}
