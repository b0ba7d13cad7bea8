//! Image manipulation capability.
//!
//! Stages reach downloads, extraction, loop mounts and compression only
//! through [`ImageBuilder`]. [`SystemImageBuilder`] is the implementation
//! backed by the host's `xz`, `mount` and `umount` tools.

mod checksum;
mod command;
mod system;

pub use checksum::{
    file_digest, file_digests, file_digests_async, verify_file_checksum, ChecksumKind, ChecksumMap,
};
pub use command::{run_command, CommandOutput};
pub use system::SystemImageBuilder;

use crate::errors::BuildResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Primitive image operations used by the build stages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Downloads the compressed base image, reusing a cached copy when one exists.
    async fn download_image(&self) -> BuildResult<PathBuf>;

    /// Checks `path` against an expected hex digest.
    async fn verify_checksum(
        &self,
        path: &Path,
        expected: &str,
        kind: ChecksumKind,
    ) -> BuildResult<bool>;

    /// Decompresses a downloaded image and returns the raw image path.
    async fn extract_image(&self, compressed: &Path) -> BuildResult<PathBuf>;

    /// Loop-mounts the partition starting at `offset` bytes onto `mount_point`.
    async fn mount_partition(&self, image: &Path, mount_point: &Path, offset: u64)
        -> BuildResult<()>;

    /// Unmounts every given mount point.
    async fn unmount_image(&self, mount_points: &[PathBuf]) -> BuildResult<()>;

    /// Compresses the raw image and returns the compressed path.
    async fn compress_image(&self, image: &Path) -> BuildResult<PathBuf>;

    /// Computes every supported digest of `path`.
    async fn generate_checksum(&self, path: &Path) -> BuildResult<ChecksumMap>;
}
