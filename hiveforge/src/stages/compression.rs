//! Unmounts, compresses and checksums the finished image.

use super::mount::remove_mount_dirs;
use super::{BuildStage, COMPRESSION};
use crate::artifact::write_metadata;
use crate::context::PipelineState;
use crate::errors::BuildResult;
use crate::image::ImageBuilder;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Produces the compressed artifact and its metadata sidecar.
pub struct CompressionStage {
    builder: Arc<dyn ImageBuilder>,
}

impl std::fmt::Debug for CompressionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionStage").finish_non_exhaustive()
    }
}

impl CompressionStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    async fn compress(&self, state: &mut PipelineState) -> BuildResult<()> {
        let mounts = state.active_mounts();
        let unmounted = if mounts.is_empty() {
            Ok(())
        } else {
            info!(mounts = mounts.len(), "Unmounting partitions");
            self.builder.unmount_image(&mounts).await
        };
        // the mounts are gone or unrecoverable either way
        state.clear_mounts();
        unmounted?;
        remove_mount_dirs(&mounts).await;

        let image = state.require_image_path()?.to_path_buf();
        info!(image = %image.display(), "Compressing image");
        let output = self.builder.compress_image(&image).await?;
        state.output_file = Some(output.clone());

        let checksums = self.builder.generate_checksum(&output).await?;
        let metadata = write_metadata(&output, &checksums, &state.config).await?;

        info!(
            output = %output.display(),
            sha256 = checksums.get("sha256").map_or("", String::as_str),
            "Image compressed"
        );
        state.checksums = Some(checksums);
        state.metadata_file = Some(metadata);
        Ok(())
    }
}

#[async_trait]
impl BuildStage for CompressionStage {
    fn name(&self) -> &str {
        COMPRESSION
    }

    fn check_preconditions(&self, state: &PipelineState) -> BuildResult<()> {
        state.require_image_path().map(|_| ())
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        match self.compress(state).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(error = %e, category = %e.category(), "Failed to compress image");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::errors::BuildError;
    use crate::image::{ChecksumMap, MockImageBuilder};
    use std::path::{Path, PathBuf};

    fn mounted_state(image: PathBuf) -> PipelineState {
        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));
        state.image_path = Some(image);
        state.boot_mount = Some(PathBuf::from("/mnt/boot"));
        state.root_mount = Some(PathBuf::from("/mnt/rootfs"));
        state
    }

    #[tokio::test]
    async fn test_compress_records_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.img");
        let output = dir.path().join("base.img.xz");
        std::fs::write(&output, b"xz").unwrap();

        let mut builder = MockImageBuilder::new();
        builder
            .expect_unmount_image()
            .withf(|mounts: &[PathBuf]| mounts.len() == 2)
            .times(1)
            .returning(|_| Ok(()));
        let compressed = output.clone();
        builder
            .expect_compress_image()
            .returning(move |_| Ok(compressed.clone()));
        builder.expect_generate_checksum().returning(|_| {
            Ok(ChecksumMap::from([
                ("md5".to_string(), "m".to_string()),
                ("sha256".to_string(), "s".to_string()),
            ]))
        });

        let stage = CompressionStage::new(Arc::new(builder));
        let mut state = mounted_state(image);

        assert!(stage.execute(&mut state).await.unwrap());
        assert!(state.mount_points().is_empty());
        assert_eq!(state.output_file, Some(output));
        assert_eq!(state.checksums.as_ref().unwrap().len(), 2);
        let sidecar = state.metadata_file.unwrap();
        assert_eq!(sidecar, dir.path().join("base.img.json"));
        assert!(sidecar.is_file());
    }

    #[tokio::test]
    async fn test_unmount_failure_clears_mounts_and_fails() {
        let mut builder = MockImageBuilder::new();
        builder
            .expect_unmount_image()
            .returning(|_| Err(BuildError::Build("target is busy".into())));
        builder.expect_compress_image().never();

        let stage = CompressionStage::new(Arc::new(builder));
        let mut state = mounted_state(PathBuf::from("/work/base.img"));

        assert!(!stage.execute(&mut state).await.unwrap());
        assert!(state.boot_mount.is_none());
        assert!(state.root_mount.is_none());
        assert!(state.output_file.is_none());
    }

    #[tokio::test]
    async fn test_cached_run_skips_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("base.img.xz");
        std::fs::write(&output, b"xz").unwrap();

        let mut builder = MockImageBuilder::new();
        builder.expect_unmount_image().never();
        let compressed = output.clone();
        builder
            .expect_compress_image()
            .withf(|image: &Path| image.ends_with("base.img"))
            .returning(move |_| Ok(compressed.clone()));
        builder
            .expect_generate_checksum()
            .returning(|_| Ok(ChecksumMap::new()));

        let stage = CompressionStage::new(Arc::new(builder));
        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));
        state.image_path = Some(dir.path().join("base.img"));
        state.cached_unpacked_path = Some(dir.path().to_path_buf());
        state.boot_mount = Some(dir.path().join("boot"));
        state.root_mount = Some(dir.path().join("rootfs"));
        std::fs::create_dir_all(dir.path().join("boot")).unwrap();
        std::fs::create_dir_all(dir.path().join("rootfs")).unwrap();

        assert!(stage.execute(&mut state).await.unwrap());
        assert!(state.mount_points().is_empty());
        assert!(state.metadata_file.is_some());
        assert!(dir.path().join("boot").is_dir());
        assert!(dir.path().join("rootfs").is_dir());
    }

    #[tokio::test]
    async fn test_unmounted_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("mnt").join("build-1");
        let output = dir.path().join("base.img.xz");
        std::fs::write(&output, b"xz").unwrap();

        let mut builder = MockImageBuilder::new();
        builder.expect_unmount_image().times(1).returning(|_| Ok(()));
        let compressed = output.clone();
        builder
            .expect_compress_image()
            .returning(move |_| Ok(compressed.clone()));
        builder
            .expect_generate_checksum()
            .returning(|_| Ok(ChecksumMap::new()));

        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));
        state.image_path = Some(dir.path().join("base.img"));
        state.boot_mount = Some(base.join("boot"));
        state.root_mount = Some(base.join("rootfs"));
        std::fs::create_dir_all(base.join("boot")).unwrap();
        std::fs::create_dir_all(base.join("rootfs")).unwrap();

        let stage = CompressionStage::new(Arc::new(builder));
        assert!(stage.execute(&mut state).await.unwrap());
        assert!(!base.exists());
    }

    #[tokio::test]
    async fn test_failed_unmount_keeps_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        std::fs::create_dir_all(&boot).unwrap();

        let mut builder = MockImageBuilder::new();
        builder
            .expect_unmount_image()
            .returning(|_| Err(BuildError::Build("target is busy".into())));

        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));
        state.image_path = Some(dir.path().join("base.img"));
        state.boot_mount = Some(boot.clone());

        let stage = CompressionStage::new(Arc::new(builder));
        assert!(!stage.execute(&mut state).await.unwrap());
        assert!(boot.is_dir());
    }
}
