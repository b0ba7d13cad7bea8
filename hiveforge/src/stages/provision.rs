//! Writes the hive's identity and access settings into the image.

use super::mount::{mount_dir, remove_mount_dirs, CACHE_BOOT_DIR, CACHE_ROOT_DIR};
use super::{BuildStage, PROVISION};
use crate::config::BuildConfig;
use crate::context::PipelineState;
use crate::errors::{BuildError, BuildResult};
use crate::image::ImageBuilder;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identity file written to `/etc/hive/hive.json`.
#[derive(Debug, Serialize)]
struct HiveIdentity<'a> {
    hive_id: &'a str,
    version: &'a str,
    base_image_version: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Boot,
    Root,
}

impl Partition {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Boot => CACHE_BOOT_DIR,
            Self::Root => CACHE_ROOT_DIR,
        }
    }
}

#[derive(Debug)]
struct PlannedFile {
    partition: Partition,
    relative: PathBuf,
    contents: String,
}

impl PlannedFile {
    fn new(partition: Partition, relative: impl Into<PathBuf>, contents: String) -> Self {
        Self {
            partition,
            relative: relative.into(),
            contents,
        }
    }

    /// Location inside the image, e.g. `rootfs/etc/hostname`.
    fn image_path(&self) -> String {
        Path::new(self.partition.dir_name())
            .join(&self.relative)
            .display()
            .to_string()
    }
}

/// Customizes the boot and root partitions.
///
/// Mounted partitions are written in place. When they are served from the
/// unpacked cache, which is never modified, the build's own raw image is
/// mounted for the duration of the write and unmounted again.
#[derive(Clone)]
pub struct ProvisionStage {
    builder: Arc<dyn ImageBuilder>,
}

impl std::fmt::Debug for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionStage").finish_non_exhaustive()
    }
}

impl ProvisionStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }

    fn plan(config: &BuildConfig) -> BuildResult<Vec<PlannedFile>> {
        let mut files = Vec::new();

        let hostname = config
            .system
            .hostname
            .clone()
            .unwrap_or_else(|| format!("hive-{}", config.hive.id));
        files.push(PlannedFile::new(
            Partition::Root,
            "etc/hostname",
            format!("{hostname}\n"),
        ));

        let identity = HiveIdentity {
            hive_id: &config.hive.id,
            version: &config.hive.version,
            base_image_version: &config.base_image.version,
        };
        files.push(PlannedFile::new(
            Partition::Root,
            "etc/hive/hive.json",
            serde_json::to_string_pretty(&identity)?,
        ));

        if let Some(key) = config.system.ssh_public_key.as_deref() {
            let keys = Path::new("home")
                .join(&config.system.user)
                .join(".ssh/authorized_keys");
            files.push(PlannedFile::new(
                Partition::Root,
                keys,
                format!("{}\n", key.trim_end()),
            ));
        }

        if config.system.enable_ssh {
            files.push(PlannedFile::new(Partition::Boot, "ssh", String::new()));
        }

        Ok(files)
    }

    async fn write_all(files: &[PlannedFile], boot: &Path, root: &Path) -> BuildResult<()> {
        for file in files {
            let base = match file.partition {
                Partition::Boot => boot,
                Partition::Root => root,
            };
            write_file(&base.join(&file.relative), &file.contents).await?;
        }
        Ok(())
    }

    /// Mounts the build's raw image, writes `files` into it and unmounts it.
    async fn write_through_image(
        &self,
        state: &PipelineState,
        files: &[PlannedFile],
    ) -> BuildResult<()> {
        let image = state.require_image_path()?;
        if let Some(cache) = state.cached_unpacked_path.as_deref() {
            if image.starts_with(cache) {
                return Err(BuildError::Build(format!(
                    "refusing to provision {} inside the unpacked cache",
                    image.display()
                )));
            }
        }

        let base = mount_dir(state);
        let boot = base.join(CACHE_BOOT_DIR);
        let root = base.join(CACHE_ROOT_DIR);
        tokio::fs::create_dir_all(&boot).await?;
        tokio::fs::create_dir_all(&root).await?;
        info!(
            image = %image.display(),
            mount_dir = %base.display(),
            "Mounting build image for provisioning"
        );

        let config = &state.config.build;
        let mut mounted = Vec::with_capacity(2);
        let mut result = self
            .builder
            .mount_partition(image, &boot, config.boot_offset)
            .await;
        if result.is_ok() {
            mounted.push(boot.clone());
            result = self
                .builder
                .mount_partition(image, &root, config.root_offset)
                .await;
        }
        if result.is_ok() {
            mounted.push(root.clone());
            result = Self::write_all(files, &boot, &root).await;
        }

        let unmounted = if mounted.is_empty() {
            Ok(())
        } else {
            self.builder.unmount_image(&mounted).await
        };
        match &unmounted {
            Ok(()) => remove_mount_dirs(&[boot, root]).await,
            Err(e) => warn!(error = %e, "Failed to unmount provisioning mounts"),
        }

        result.and(unmounted)
    }
}

async fn write_file(path: &Path, contents: &str) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    debug!(path = %path.display(), "Wrote file");
    Ok(())
}

#[async_trait]
impl BuildStage for ProvisionStage {
    fn name(&self) -> &str {
        PROVISION
    }

    fn check_preconditions(&self, state: &PipelineState) -> BuildResult<()> {
        state.require_boot_mount()?;
        state.require_root_mount()?;
        Ok(())
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        let boot = state.require_boot_mount()?.to_path_buf();
        let root = state.require_root_mount()?.to_path_buf();
        let files = Self::plan(&state.config)?;

        let result = if state.uses_unpacked_cache() {
            self.write_through_image(state, &files).await
        } else {
            Self::write_all(&files, &boot, &root).await
        };

        match result {
            Ok(()) => {
                info!(files = files.len(), "Provisioned image");
                let written: Vec<String> = files.iter().map(PlannedFile::image_path).collect();
                state.set_extra("provisioned_files", serde_json::json!(written));
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "Failed to provision image");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MockImageBuilder;
    use crate::testing::fixtures::unpacked_image;
    use crate::testing::mocks::FakeImageBuilder;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn no_mount_builder() -> Arc<MockImageBuilder> {
        let mut builder = MockImageBuilder::new();
        builder.expect_mount_partition().never();
        builder.expect_unmount_image().never();
        Arc::new(builder)
    }

    fn mounted_state(config: BuildConfig, dir: &Path) -> PipelineState {
        let unpacked = unpacked_image(dir);
        let mut state = PipelineState::new(Arc::new(config));
        state.boot_mount = Some(unpacked.boot);
        state.root_mount = Some(unpacked.root);
        state
    }

    /// State whose partitions come from an unpacked cache under `dir/cache`
    /// and whose raw image is a per-build copy under `dir/work`.
    fn cached_state(config: BuildConfig, dir: &Path) -> PipelineState {
        let unpacked = unpacked_image(&dir.join("cache"));
        let mut config = config;
        config.build.work_dir = dir.join("work");
        let mut state = PipelineState::new(Arc::new(config));

        let image = state.build_dir().join("image.img");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"raw image").unwrap();

        state.image_path = Some(image);
        state.cached_unpacked_path = Some(unpacked.root_dir);
        state.boot_mount = Some(unpacked.boot);
        state.root_mount = Some(unpacked.root);
        state
    }

    #[tokio::test]
    async fn test_writes_hostname_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::default();
        config.hive.id = "apiary-07".into();
        config.system.ssh_password = Some("hunter2".into());
        let mut state = mounted_state(config, dir.path());
        let root = state.root_mount.clone().unwrap();

        let stage = ProvisionStage::new(no_mount_builder());
        assert!(stage.execute(&mut state).await.unwrap());

        assert_eq!(
            fs::read_to_string(root.join("etc/hostname")).unwrap(),
            "hive-apiary-07\n"
        );
        let identity = fs::read_to_string(root.join("etc/hive/hive.json")).unwrap();
        assert!(identity.contains("apiary-07"));
        assert!(!identity.contains("hunter2"));

        let files = state.extras["provisioned_files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], "rootfs/etc/hostname");
    }

    #[tokio::test]
    async fn test_installs_ssh_access() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::default();
        config.system.hostname = Some("queen".into());
        config.system.enable_ssh = true;
        config.system.ssh_public_key = Some("ssh-ed25519 AAAA fleet@host".into());
        let mut state = mounted_state(config, dir.path());
        let boot = state.boot_mount.clone().unwrap();
        let root = state.root_mount.clone().unwrap();

        let stage = ProvisionStage::new(no_mount_builder());
        assert!(stage.execute(&mut state).await.unwrap());

        assert!(boot.join("ssh").is_file());
        assert_eq!(
            fs::read_to_string(root.join("home/pi/.ssh/authorized_keys")).unwrap(),
            "ssh-ed25519 AAAA fleet@host\n"
        );
        assert_eq!(fs::read_to_string(root.join("etc/hostname")).unwrap(), "queen\n");
    }

    #[tokio::test]
    async fn test_cache_backed_build_writes_through_own_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::default();
        config.system.enable_ssh = true;
        let mut state = cached_state(config, dir.path());
        let cache_boot = state.boot_mount.clone().unwrap();
        let cache_root = state.root_mount.clone().unwrap();

        let builder = Arc::new(FakeImageBuilder::new(dir.path()));
        let stage = ProvisionStage::new(builder.clone());
        assert!(stage.execute(&mut state).await.unwrap());

        assert!(!cache_root.join("etc/hostname").exists());
        assert!(!cache_root.join("etc/hive").exists());
        assert!(!cache_boot.join("ssh").exists());

        let calls = builder.calls();
        let mounts: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("mount_partition"))
            .collect();
        assert_eq!(mounts.len(), 2);
        let work = dir.path().join("work").display().to_string();
        assert!(mounts.iter().all(|c| c.contains(&work)));
        assert_eq!(builder.unmounted().len(), 2);

        // cache directories stay the partitions later stages read
        assert_eq!(state.boot_mount, Some(cache_boot));
        assert!(!mount_dir(&state).exists());
        assert_eq!(state.extras["provisioned_files"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cache_backed_build_rejects_cached_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = cached_state(BuildConfig::default(), dir.path());
        state.image_path = Some(dir.path().join("cache").join("image.img"));

        let stage = ProvisionStage::new(no_mount_builder());
        assert!(!stage.execute(&mut state).await.unwrap());
        assert!(!dir.path().join("cache/rootfs/etc/hostname").exists());
    }

    #[tokio::test]
    async fn test_root_mount_failure_unmounts_boot() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = cached_state(BuildConfig::default(), dir.path());

        let mut builder = MockImageBuilder::new();
        builder
            .expect_mount_partition()
            .withf(|_, point, _| point.ends_with(CACHE_BOOT_DIR))
            .times(1)
            .returning(|_, _, _| Ok(()));
        builder
            .expect_mount_partition()
            .withf(|_, point, _| point.ends_with(CACHE_ROOT_DIR))
            .times(1)
            .returning(|_, _, _| Err(BuildError::Build("no free loop device".into())));
        builder
            .expect_unmount_image()
            .withf(|points: &[PathBuf]| {
                points.len() == 1 && points[0].ends_with(CACHE_BOOT_DIR)
            })
            .times(1)
            .returning(|_| Ok(()));

        let stage = ProvisionStage::new(Arc::new(builder));
        assert!(!stage.execute(&mut state).await.unwrap());
        assert!(!mount_dir(&state).exists());
    }

    #[test]
    fn test_requires_mounts() {
        let state = PipelineState::new(Arc::new(BuildConfig::default()));
        let stage = ProvisionStage::new(no_mount_builder());
        assert!(stage.check_preconditions(&state).is_err());
    }
}
