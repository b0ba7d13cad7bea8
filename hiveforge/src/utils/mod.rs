//! Timestamp helpers shared by stages and artifacts.

pub mod timestamps;

pub use timestamps::{format_iso8601, iso_timestamp, local_publish_stamp, publish_stamp};
