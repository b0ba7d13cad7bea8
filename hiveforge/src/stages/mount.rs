//! Exposes the image's partitions as directories.

use super::{BuildStage, MOUNT};
use crate::context::PipelineState;
use crate::errors::{BuildError, BuildResult};
use crate::image::ImageBuilder;
use crate::validation::{BOOT_CONFIG_FILES, ROOTFS_REQUIRED_DIRS};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Boot partition directory inside an unpacked cache.
pub const CACHE_BOOT_DIR: &str = "boot";
/// Root partition directory inside an unpacked cache.
pub const CACHE_ROOT_DIR: &str = "rootfs";

/// Mounts the boot and root partitions, or reuses an unpacked cache.
pub struct MountStage {
    builder: Arc<dyn ImageBuilder>,
}

impl std::fmt::Debug for MountStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountStage").finish_non_exhaustive()
    }
}

impl MountStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    fn use_cache(state: &mut PipelineState, cached: &Path) -> BuildResult<()> {
        let boot = cached.join(CACHE_BOOT_DIR);
        let root = cached.join(CACHE_ROOT_DIR);
        verify_unpacked(&boot, &root)?;

        info!(cache = %cached.display(), "Using unpacked image cache, skipping mount");
        state.boot_mount = Some(boot);
        state.root_mount = Some(root);
        Ok(())
    }

    async fn mount(&self, state: &mut PipelineState) -> BuildResult<()> {
        let image = state.require_image_path()?.to_path_buf();
        if !image.is_file() {
            return Err(BuildError::FileNotFound(image));
        }

        let boot_offset = state.config.build.boot_offset;
        let root_offset = state.config.build.root_offset;
        let base = mount_dir(state);
        let boot = base.join(CACHE_BOOT_DIR);
        let root = base.join(CACHE_ROOT_DIR);
        tokio::fs::create_dir_all(&boot).await?;
        tokio::fs::create_dir_all(&root).await?;

        info!(image = %image.display(), mount_dir = %base.display(), "Mounting image partitions");

        self.builder
            .mount_partition(&image, &boot, boot_offset)
            .await?;
        state.boot_mount = Some(boot);

        self.builder
            .mount_partition(&image, &root, root_offset)
            .await?;
        state.root_mount = Some(root);

        Ok(())
    }
}

/// Directory holding this build's `boot/` and `rootfs/` mount points.
pub(crate) fn mount_dir(state: &PipelineState) -> PathBuf {
    state
        .config
        .build
        .work_dir
        .join("mnt")
        .join(state.build_id.to_string())
}

/// Deletes unmounted mount-point directories and their per-build parent.
///
/// Only empty directories are removed, so a partition that is somehow still
/// mounted is left alone.
pub(crate) async fn remove_mount_dirs(points: &[PathBuf]) {
    for point in points {
        match tokio::fs::remove_dir(point).await {
            Ok(()) => debug!(path = %point.display(), "Removed mount point"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %point.display(), error = %e, "Failed to remove mount point"),
        }
    }

    let mut parents: Vec<&Path> = points.iter().filter_map(|p| p.parent()).collect();
    parents.dedup();
    for parent in parents {
        match tokio::fs::remove_dir(parent).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!(path = %parent.display(), error = %e, "Mount directory kept"),
        }
    }
}

/// Checks that `boot` and `root` look like an unpacked image.
pub fn verify_unpacked(boot: &Path, root: &Path) -> BuildResult<()> {
    if !BOOT_CONFIG_FILES.iter().any(|f| boot.join(f).is_file()) {
        return Err(BuildError::Build(format!(
            "cached boot partition {} has neither {}",
            boot.display(),
            BOOT_CONFIG_FILES.join(" nor ")
        )));
    }
    for dir in ROOTFS_REQUIRED_DIRS {
        if !root.join(dir).is_dir() {
            return Err(BuildError::Build(format!(
                "cached root partition {} is missing {dir}/",
                root.display()
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl BuildStage for MountStage {
    fn name(&self) -> &str {
        MOUNT
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        let result = match state.cached_unpacked_path.clone() {
            Some(cached) => Self::use_cache(state, &cached),
            None => self.mount(state).await,
        };

        match result {
            Ok(()) => {
                debug!(
                    boot = ?state.boot_mount,
                    root = ?state.root_mount,
                    "Partitions available"
                );
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "Failed to mount image");
                debug!(error = ?e, "Mount failure detail");
                Ok(false)
            }
        }
    }
}
