//! # Hiveforge
//!
//! Builds customized operating-system images for fleet edge devices
//! ("hives").
//!
//! A build runs a fixed sequence of stages over one shared
//! [`context::PipelineState`]:
//!
//! - **Download**: fetch, verify and extract the base image
//! - **Mount**: loop-mount the partitions, or reuse an unpacked cache
//! - **Provision**: write hostname, identity and SSH access into the image
//! - **Validation**: check structure, required files and services
//! - **Compression**: unmount, compress, checksum and write a metadata sidecar
//! - **Publication**: copy the artifact to the image server and derive its URL
//!
//! Each stage runs behind its own circuit breaker and never lets an error
//! escape; the orchestrator stops at the first failing stage and releases
//! any partitions left mounted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hiveforge::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BuildConfig::resolve(
//!     Some(std::path::Path::new("hive.yaml")),
//!     &ProcessEnv,
//!     ConfigOverrides::default(),
//! )?;
//! let builder = Arc::new(SystemImageBuilder::new(&config));
//! let validator = Arc::new(FilesystemValidator::new(&config));
//!
//! let outcome = BuildOrchestrator::new(builder, validator)
//!     .run(Arc::new(config))
//!     .await?;
//! println!("completed: {:?}", outcome.completed_stages());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifact;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod image;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod utils;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BuildConfig, ConfigOverrides, EnvSource, ProcessEnv};
    pub use crate::context::PipelineState;
    pub use crate::errors::{BuildError, BuildResult, ConfigError, ErrorCategory};
    pub use crate::events::{BuildEvent, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::image::{ChecksumKind, ImageBuilder, SystemImageBuilder};
    pub use crate::pipeline::{
        ArtifactType, BuildOrchestrator, BuildOutcome, BuildStatus, CircuitBreaker,
        CircuitBreakerConfig,
    };
    pub use crate::stages::{BuildStage, StageRunner};
    pub use crate::utils::iso_timestamp;
    pub use crate::validation::{FilesystemValidator, ImageValidator, ValidationResults};
}
