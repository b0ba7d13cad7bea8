//! [`ImageBuilder`] backed by host tools.

use super::checksum::{file_digests_async, verify_file_checksum, ChecksumKind, ChecksumMap};
use super::command::run_command;
use super::ImageBuilder;
use crate::config::{BaseImageConfig, BuildConfig};
use crate::errors::{BuildError, BuildResult};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Builds images with `xz`, `mount` and `umount`, downloading over HTTP.
#[derive(Debug, Clone)]
pub struct SystemImageBuilder {
    base_image: BaseImageConfig,
    cache_dir: PathBuf,
    work_dir: PathBuf,
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl SystemImageBuilder {
    /// Creates a builder for the given configuration.
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            base_image: config.base_image.clone(),
            cache_dir: config.build.cache_dir.clone(),
            work_dir: config.build.work_dir.clone(),
            #[cfg(feature = "http")]
            client: reqwest::Client::new(),
        }
    }

    /// Where the compressed base image is cached.
    #[must_use]
    pub fn cached_download_path(&self) -> PathBuf {
        self.cache_dir.join(self.base_image.file_name())
    }

    async fn is_cache_hit(&self, path: &Path) -> BuildResult<bool> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(false);
        }
        let Some(expected) = self.base_image.checksum.clone() else {
            debug!(path = %path.display(), "Cached download present, no checksum to compare");
            return Ok(true);
        };

        let kind = self.base_image.checksum_type;
        let candidate = path.to_path_buf();
        let matches = tokio::task::spawn_blocking(move || {
            verify_file_checksum(&candidate, &expected, kind)
        })
        .await
        .map_err(|e| BuildError::Unexpected(e.to_string()))??;

        if !matches {
            warn!(path = %path.display(), "Cached download has a stale checksum, fetching again");
        }
        Ok(matches)
    }

    #[cfg(feature = "http")]
    async fn fetch(&self, url: &str, target: &Path) -> BuildResult<()> {
        use tokio::io::AsyncWriteExt;

        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length();
        let partial = target.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut received: u64 = 0;
        let mut last_logged: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if received - last_logged >= 64 * 1024 * 1024 {
                last_logged = received;
                debug!(received_bytes = received, total_bytes = ?total, "Download progress");
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, target).await?;
        info!(url = %url, bytes = received, "Download finished");
        Ok(())
    }

    #[cfg(not(feature = "http"))]
    async fn fetch(&self, url: &str, _target: &Path) -> BuildResult<()> {
        Err(BuildError::Transport(format!(
            "cannot download {url}: built without the 'http' feature"
        )))
    }
}

#[async_trait]
impl ImageBuilder for SystemImageBuilder {
    async fn download_image(&self) -> BuildResult<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let target = self.cached_download_path();

        if self.is_cache_hit(&target).await? {
            info!(path = %target.display(), "Using cached base image");
            return Ok(target);
        }

        let url = self.base_image.resolved_url();
        info!(url = %url, target = %target.display(), "Downloading base image");
        self.fetch(&url, &target).await?;
        Ok(target)
    }

    async fn verify_checksum(
        &self,
        path: &Path,
        expected: &str,
        kind: ChecksumKind,
    ) -> BuildResult<bool> {
        let path = path.to_path_buf();
        let expected = expected.to_string();
        let matches =
            tokio::task::spawn_blocking(move || verify_file_checksum(&path, &expected, kind))
                .await
                .map_err(|e| BuildError::Unexpected(e.to_string()))??;
        Ok(matches)
    }

    async fn extract_image(&self, compressed: &Path) -> BuildResult<PathBuf> {
        if !tokio::fs::try_exists(compressed).await? {
            return Err(BuildError::FileNotFound(compressed.to_path_buf()));
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let is_xz = compressed
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xz"));
        let file_name = compressed
            .file_stem()
            .filter(|_| is_xz)
            .or_else(|| compressed.file_name())
            .ok_or_else(|| BuildError::Build(format!("no file name in {}", compressed.display())))?;
        let raw = self.work_dir.join(file_name);

        if !is_xz {
            tokio::fs::copy(compressed, &raw).await?;
            return Ok(raw);
        }

        info!(source = %compressed.display(), target = %raw.display(), "Extracting image");
        let out = std::fs::File::create(&raw)?;
        let status = tokio::process::Command::new("xz")
            .arg("--decompress")
            .arg("--stdout")
            .arg(compressed)
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError::Build(format!("failed to spawn xz: {e}")))?;

        if !status.status.success() {
            // drop the partial output
            let _ = tokio::fs::remove_file(&raw).await;
            return Err(BuildError::Command {
                command: format!("xz --decompress --stdout {}", compressed.display()),
                status: status.status.to_string(),
                stderr: String::from_utf8_lossy(&status.stderr).trim().to_string(),
            });
        }
        Ok(raw)
    }

    async fn mount_partition(
        &self,
        image: &Path,
        mount_point: &Path,
        offset: u64,
    ) -> BuildResult<()> {
        tokio::fs::create_dir_all(mount_point).await?;
        let options = format!("loop,offset={offset}");
        run_command(
            "mount",
            [
                OsStr::new("-o"),
                OsStr::new(&options),
                image.as_os_str(),
                mount_point.as_os_str(),
            ],
        )
        .await?;
        info!(
            image = %image.display(),
            mount_point = %mount_point.display(),
            offset,
            "Mounted partition"
        );
        Ok(())
    }

    async fn unmount_image(&self, mount_points: &[PathBuf]) -> BuildResult<()> {
        if mount_points.is_empty() {
            return Ok(());
        }
        if let Err(e) = run_command("sync", std::iter::empty::<&str>()).await {
            warn!(error = %e, "sync before unmount failed");
        }

        let mut failures = Vec::new();
        for mount_point in mount_points {
            match run_command("umount", [mount_point.as_os_str()]).await {
                Ok(_) => info!(mount_point = %mount_point.display(), "Unmounted partition"),
                Err(e) => {
                    warn!(mount_point = %mount_point.display(), error = %e, "Failed to unmount");
                    failures.push(mount_point.display().to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Build(format!(
                "failed to unmount: {}",
                failures.join(", ")
            )))
        }
    }

    async fn compress_image(&self, image: &Path) -> BuildResult<PathBuf> {
        if !tokio::fs::try_exists(image).await? {
            return Err(BuildError::FileNotFound(image.to_path_buf()));
        }
        info!(image = %image.display(), "Compressing image");
        run_command(
            "xz",
            [
                OsStr::new("--compress"),
                OsStr::new("--keep"),
                OsStr::new("--force"),
                OsStr::new("--threads=0"),
                image.as_os_str(),
            ],
        )
        .await?;

        let mut compressed = image.as_os_str().to_os_string();
        compressed.push(".xz");
        Ok(PathBuf::from(compressed))
    }

    async fn generate_checksum(&self, path: &Path) -> BuildResult<ChecksumMap> {
        Ok(file_digests_async(path, &ChecksumKind::ALL).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn builder_in(dir: &Path) -> SystemImageBuilder {
        let mut config = BuildConfig::default();
        config.build.cache_dir = dir.join("cache");
        config.build.work_dir = dir.join("work");
        config.base_image.url = "https://example.invalid/images/base.img.xz".into();
        SystemImageBuilder::new(&config)
    }

    #[test]
    fn test_cached_download_path() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        assert_eq!(
            builder.cached_download_path(),
            dir.path().join("cache").join("base.img.xz")
        );
    }

    #[tokio::test]
    async fn test_download_reuses_cached_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(builder.cached_download_path(), b"cached").unwrap();

        // no network access happens for a cache hit
        let path = builder.download_image().await.unwrap();
        assert_eq!(path, builder.cached_download_path());
    }

    #[tokio::test]
    async fn test_extract_copies_uncompressed_images() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        let source = dir.path().join("plain.img");
        std::fs::File::create(&source)
            .unwrap()
            .write_all(b"raw image")
            .unwrap();

        let raw = builder.extract_image(&source).await.unwrap();
        assert_eq!(raw, dir.path().join("work").join("plain.img"));
        assert_eq!(std::fs::read(raw).unwrap(), b"raw image");
    }

    #[tokio::test]
    async fn test_extract_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        let err = builder
            .extract_image(&dir.path().join("missing.img.xz"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_generate_checksum_has_all_algorithms() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        let file = dir.path().join("artifact.img.xz");
        std::fs::write(&file, b"test data").unwrap();

        let checksums = builder.generate_checksum(&file).await.unwrap();
        assert_eq!(
            checksums.keys().cloned().collect::<Vec<_>>(),
            vec!["md5".to_string(), "sha256".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unmount_nothing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let builder = builder_in(dir.path());
        assert!(builder.unmount_image(&[]).await.is_ok());
    }
}
