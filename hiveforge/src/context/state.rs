//! The per-build pipeline state.

use crate::config::BuildConfig;
use crate::errors::{BuildError, BuildResult};
use crate::image::ChecksumMap;
use crate::validation::ValidationResults;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// State shared by every stage of one build.
///
/// This is the only channel between stages. Fields are `None` until the
/// stage that produces them has run. Nothing is cleared implicitly; only
/// compression and orchestrator teardown reset the mount points.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    /// Identifier of this build.
    pub build_id: Uuid,
    /// Resolved configuration, read-only to stages.
    #[serde(skip)]
    pub config: Arc<BuildConfig>,
    /// Raw working image.
    pub image_path: Option<PathBuf>,
    /// Mounted boot partition.
    pub boot_mount: Option<PathBuf>,
    /// Mounted root partition.
    pub root_mount: Option<PathBuf>,
    /// Previously unpacked image reused instead of mounting.
    pub cached_unpacked_path: Option<PathBuf>,
    /// Stages that finished successfully, in order.
    pub completed_stages: Vec<String>,
    /// Compressed artifact.
    pub output_file: Option<PathBuf>,
    /// Digests of [`Self::output_file`].
    pub checksums: Option<ChecksumMap>,
    /// Metadata sidecar written next to [`Self::output_file`].
    pub metadata_file: Option<PathBuf>,
    /// Outcome of the validation stage.
    pub validation_results: Option<ValidationResults>,
    /// Where the artifact was published.
    pub published_image_path: Option<PathBuf>,
    /// Public URL of the published artifact.
    pub download_url: Option<String>,
    /// Free-form values recorded by provisioning stages.
    pub extras: HashMap<String, serde_json::Value>,
}

impl PipelineState {
    /// Creates the state for a new build.
    #[must_use]
    pub fn new(config: Arc<BuildConfig>) -> Self {
        Self {
            build_id: Uuid::new_v4(),
            config,
            image_path: None,
            boot_mount: None,
            root_mount: None,
            cached_unpacked_path: None,
            completed_stages: Vec::new(),
            output_file: None,
            checksums: None,
            metadata_file: None,
            validation_results: None,
            published_image_path: None,
            download_url: None,
            extras: HashMap::new(),
        }
    }

    /// Returns the working image path or a missing-state error.
    pub fn require_image_path(&self) -> BuildResult<&Path> {
        self.image_path
            .as_deref()
            .ok_or(BuildError::MissingState { key: "image_path" })
    }

    /// Returns the boot mount point or a missing-state error.
    pub fn require_boot_mount(&self) -> BuildResult<&Path> {
        self.boot_mount
            .as_deref()
            .ok_or(BuildError::MissingState { key: "boot_mount" })
    }

    /// Returns the root mount point or a missing-state error.
    pub fn require_root_mount(&self) -> BuildResult<&Path> {
        self.root_mount
            .as_deref()
            .ok_or(BuildError::MissingState { key: "root_mount" })
    }

    /// Returns the compressed artifact path or a missing-state error.
    pub fn require_output_file(&self) -> BuildResult<&Path> {
        self.output_file
            .as_deref()
            .ok_or(BuildError::MissingState { key: "output_file" })
    }

    /// Mount points currently recorded, boot first.
    #[must_use]
    pub fn mount_points(&self) -> Vec<PathBuf> {
        self.boot_mount
            .iter()
            .chain(self.root_mount.iter())
            .cloned()
            .collect()
    }

    /// Recorded mount points that are real mounts.
    ///
    /// Directories of an unpacked cache are excluded; they must never be
    /// unmounted.
    #[must_use]
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        let cache = self.cached_unpacked_path.as_deref();
        self.mount_points()
            .into_iter()
            .filter(|p| cache.map_or(true, |c| !p.starts_with(c)))
            .collect()
    }

    /// Returns true when the partitions are served from the unpacked cache.
    ///
    /// The cache is read-only to a build; writes go through a real mount of
    /// the build's own copy of the raw image instead.
    #[must_use]
    pub fn uses_unpacked_cache(&self) -> bool {
        match (self.cached_unpacked_path.as_deref(), self.boot_mount.as_deref()) {
            (Some(cache), Some(boot)) => boot.starts_with(cache),
            _ => false,
        }
    }

    /// Per-build scratch directory under the work directory.
    #[must_use]
    pub fn build_dir(&self) -> PathBuf {
        self.config
            .build
            .work_dir
            .join("builds")
            .join(self.build_id.to_string())
    }

    /// Forgets both mount points.
    pub fn clear_mounts(&mut self) {
        self.boot_mount = None;
        self.root_mount = None;
    }

    /// Returns true if `stage` has completed.
    #[must_use]
    pub fn has_completed(&self, stage: &str) -> bool {
        self.completed_stages.iter().any(|s| s == stage)
    }

    /// Records a free-form value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extras.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PipelineState {
        PipelineState::new(Arc::new(BuildConfig::default()))
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = state();
        assert!(state.image_path.is_none());
        assert!(state.completed_stages.is_empty());
        assert!(state.mount_points().is_empty());
    }

    #[test]
    fn test_require_reports_key() {
        let state = state();
        let err = state.require_output_file().unwrap_err();
        assert!(matches!(err, BuildError::MissingState { key: "output_file" }));
        assert!(state.require_image_path().is_err());
    }

    #[test]
    fn test_mounts_round_trip() {
        let mut state = state();
        state.boot_mount = Some(PathBuf::from("/mnt/boot"));
        state.root_mount = Some(PathBuf::from("/mnt/root"));
        assert_eq!(
            state.mount_points(),
            vec![PathBuf::from("/mnt/boot"), PathBuf::from("/mnt/root")]
        );

        state.clear_mounts();
        assert!(state.boot_mount.is_none());
        assert!(state.root_mount.is_none());
    }

    #[test]
    fn test_cache_dirs_are_not_active_mounts() {
        let mut state = state();
        state.cached_unpacked_path = Some(PathBuf::from("/cache/unpacked"));
        state.boot_mount = Some(PathBuf::from("/cache/unpacked/boot"));
        state.root_mount = Some(PathBuf::from("/cache/unpacked/rootfs"));
        assert_eq!(state.mount_points().len(), 2);
        assert!(state.active_mounts().is_empty());
        assert!(state.uses_unpacked_cache());

        state.boot_mount = Some(PathBuf::from("/work/mnt/boot"));
        assert!(!state.uses_unpacked_cache());
    }

    #[test]
    fn test_build_dir_is_under_work_dir() {
        let state = state();
        let dir = state.build_dir();
        assert!(dir.starts_with(&state.config.build.work_dir));
        assert!(dir.ends_with(state.build_id.to_string()));
    }

    #[test]
    fn test_build_ids_are_unique() {
        assert_ne!(state().build_id, state().build_id);
    }

    #[test]
    fn test_serializes_without_config() {
        let mut state = state();
        state.completed_stages.push("download".into());
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("config").is_none());
        assert_eq!(value["completed_stages"], serde_json::json!(["download"]));
    }
}
