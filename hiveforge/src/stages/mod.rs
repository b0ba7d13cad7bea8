//! Build stages.
//!
//! Every stage implements [`BuildStage`]; a [`StageRunner`] wraps it with the
//! fixed lifecycle (pre-run checks, breaker-guarded execution, post-run
//! bookkeeping) so the orchestrator only ever sees `true` or `false`.

mod compression;
mod download;
mod mount;
mod provision;
mod publication;
mod runner;
mod validation;

pub use compression::CompressionStage;
pub use download::{DownloadStage, CACHED_RAW_IMAGE};
pub use mount::{verify_unpacked, MountStage, CACHE_BOOT_DIR, CACHE_ROOT_DIR};
pub(crate) use mount::remove_mount_dirs;
pub use provision::ProvisionStage;
pub use publication::{copy_preserving, join_url, published_file_name, PublicationStage};
pub use runner::StageRunner;
pub use validation::{failure_lines, ValidationStage};

use crate::context::PipelineState;
use crate::errors::BuildResult;
use async_trait::async_trait;
use std::fmt::Debug;

/// Name of the download stage.
pub const DOWNLOAD: &str = "download";
/// Name of the mount stage.
pub const MOUNT: &str = "mount";
/// Name of the provisioning stage.
pub const PROVISION: &str = "provision";
/// Name of the validation stage.
pub const VALIDATION: &str = "validation";
/// Name of the compression stage.
pub const COMPRESSION: &str = "compression";
/// Name of the publication stage.
pub const PUBLICATION: &str = "publication";

/// A unit of work in the image build.
///
/// `execute` is free to fail with any [`crate::errors::BuildError`]; the
/// [`StageRunner`] converts every failure into `false`.
#[async_trait]
pub trait BuildStage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Checks preconditions before `execute` runs.
    ///
    /// A failure here is terminal for the stage and is not retried.
    fn check_preconditions(&self, _state: &PipelineState) -> BuildResult<()> {
        Ok(())
    }

    /// Performs the stage's work, writing its results into `state`.
    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool>;
}
