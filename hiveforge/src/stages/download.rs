//! Fetches, verifies and extracts the base image.

use super::{BuildStage, DOWNLOAD};
use crate::context::PipelineState;
use crate::errors::{BuildError, BuildResult, ErrorCategory};
use crate::image::ImageBuilder;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Raw image kept next to a cached unpacked tree.
pub const CACHED_RAW_IMAGE: &str = "image.img";

/// Downloads the base image and extracts it to a raw image file.
#[derive(Clone)]
pub struct DownloadStage {
    builder: Arc<dyn ImageBuilder>,
}

impl std::fmt::Debug for DownloadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStage").finish_non_exhaustive()
    }
}

impl DownloadStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    fn cached_raw_image(state: &PipelineState) -> Option<PathBuf> {
        let raw = state.cached_unpacked_path.as_ref()?.join(CACHED_RAW_IMAGE);
        raw.is_file().then_some(raw)
    }

    /// Copies the cached raw image into this build's directory.
    ///
    /// Provisioning writes into the raw image, so the cached file itself is
    /// never handed to later stages.
    async fn copy_cached(state: &PipelineState, cached: &Path) -> BuildResult<PathBuf> {
        let dir = state.build_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(CACHED_RAW_IMAGE);
        let bytes = tokio::fs::copy(cached, &target).await?;
        debug!(
            from = %cached.display(),
            to = %target.display(),
            bytes,
            "Copied cached raw image"
        );
        Ok(target)
    }

    async fn fetch(&self, state: &PipelineState) -> BuildResult<PathBuf> {
        let base = &state.config.base_image;
        info!(url = %base.resolved_url(), version = %base.version, "Fetching base image");

        let compressed = self.builder.download_image().await?;

        match base.checksum.as_deref() {
            Some(expected) => {
                let ok = self
                    .builder
                    .verify_checksum(&compressed, expected, base.checksum_type)
                    .await?;
                if !ok {
                    return Err(BuildError::Build(format!(
                        "{} checksum mismatch for {}",
                        base.checksum_type,
                        compressed.display()
                    )));
                }
                debug!(kind = %base.checksum_type, "Base image checksum verified");
            }
            None => warn!("No base image checksum configured, skipping verification"),
        }

        self.builder.extract_image(&compressed).await
    }
}

#[async_trait]
impl BuildStage for DownloadStage {
    fn name(&self) -> &str {
        DOWNLOAD
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        let result = match Self::cached_raw_image(state) {
            Some(cached) => {
                info!(image = %cached.display(), "Reusing raw image from unpacked cache");
                Self::copy_cached(state, &cached).await
            }
            None => self.fetch(state).await,
        };

        match result {
            Ok(raw) => {
                info!(image = %raw.display(), "Base image ready");
                state.image_path = Some(raw);
                Ok(true)
            }
            Err(e) => {
                match e.category() {
                    ErrorCategory::Transport => {
                        error!(error = %e, "Network error while downloading base image");
                    }
                    ErrorCategory::Build => {
                        error!(error = %e, "Image build error during download");
                    }
                    _ => error!(error = %e, "Unexpected error during download"),
                }
                Ok(false)
            }
        }
    }
}
