//! Copies the finished artifact to the image server.

use super::{BuildStage, PUBLICATION};
use crate::context::PipelineState;
use crate::errors::{BuildError, BuildResult};
use crate::utils::local_publish_stamp;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Canonical name of a published image.
///
/// ```
/// use hiveforge::stages::published_file_name;
///
/// assert_eq!(
///     published_file_name("2025-03-01_14-05", "apiary-07", "1.4.0"),
///     "2025-03-01_14-05_apiary-07_1.4.0_image.xz"
/// );
/// ```
#[must_use]
pub fn published_file_name(stamp: &str, hive_id: &str, version: &str) -> String {
    format!("{stamp}_{hive_id}_{version}_image.xz")
}

/// Joins a URL base and a file name with exactly one `/`.
#[must_use]
pub fn join_url(base: &str, file_name: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        file_name.trim_start_matches('/')
    )
}

/// Publishes the compressed image and records its public URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicationStage;

impl PublicationStage {
    /// Creates the stage.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn locate_output(state: &PipelineState) -> BuildResult<PathBuf> {
        let output = state
            .output_file
            .as_deref()
            .ok_or_else(|| BuildError::Build("no output file recorded".into()))?;
        if !output.is_file() {
            return Err(BuildError::Build(format!(
                "output file does not exist: {}",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }

    async fn publish(state: &mut PipelineState) -> BuildResult<()> {
        let output = Self::locate_output(state)?;

        let publication = &state.config.publication;
        let server_dir = publication.server_base_path();
        let url_base = publication.download_url_base();
        let file_name = published_file_name(
            &local_publish_stamp(),
            &state.config.hive.id,
            &state.config.hive.version,
        );

        tokio::fs::create_dir_all(&server_dir).await?;
        let target = server_dir.join(&file_name);
        copy_preserving(&output, &target).await?;
        if !target.is_file() {
            return Err(BuildError::Build(format!(
                "published file missing after copy: {}",
                target.display()
            )));
        }

        let url = join_url(&url_base, &file_name);
        info!("Image published");
        info!("  file: {}", target.display());
        info!("  url:  {url}");
        info!("  wget -O {file_name} {url}");

        state.published_image_path = Some(target);
        state.download_url = Some(url);
        Ok(())
    }
}

/// Copies `from` to `to`, keeping permissions and modification time.
///
/// The data is written to `<to>.part` and renamed into place, so `to` either
/// does not exist or holds the complete file.
pub async fn copy_preserving(from: &Path, to: &Path) -> BuildResult<u64> {
    let partial = partial_path(to);
    let result = copy_then_rename(from, &partial, to).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %partial.display(), error = %e, "Failed to remove partial copy");
            }
        }
    }
    result
}

fn partial_path(to: &Path) -> PathBuf {
    let mut name = to.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn copy_then_rename(from: &Path, partial: &Path, to: &Path) -> BuildResult<u64> {
    let bytes = tokio::fs::copy(from, partial).await?;

    let modified = tokio::fs::metadata(from).await?.modified()?;
    let target = partial.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&target)?
            .set_modified(modified)
    })
    .await
    .map_err(|e| BuildError::Unexpected(format!("copy task failed: {e}")))??;

    tokio::fs::rename(partial, to).await?;
    Ok(bytes)
}

#[async_trait]
impl BuildStage for PublicationStage {
    fn name(&self) -> &str {
        PUBLICATION
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        match Self::publish(state).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(error = %e, "Failed to publish image");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn state_publishing_to(server: &Path, url: &str) -> PipelineState {
        let mut config = BuildConfig::default();
        config.hive.id = "apiary-07".into();
        config.hive.version = "1.4.0".into();
        config.publication.server_base_path = Some(server.to_path_buf());
        config.publication.download_url_base = Some(url.into());
        PipelineState::new(Arc::new(config))
    }

    #[test]
    fn test_join_url_single_slash() {
        assert_eq!(join_url("http://h/images", "a.xz"), "http://h/images/a.xz");
        assert_eq!(join_url("http://h/images/", "a.xz"), "http://h/images/a.xz");
        assert_eq!(join_url("http://h/images//", "/a.xz"), "http://h/images/a.xz");
    }

    #[test]
    fn test_missing_output_recorded() {
        let state = state_publishing_to(Path::new("/nonexistent/server"), "http://h/");
        let err = PublicationStage::locate_output(&state).unwrap_err();
        assert!(err.to_string().contains("no output file recorded"));
    }

    #[tokio::test]
    async fn test_absent_output_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = dir.path().join("server");
        let mut state = state_publishing_to(&server, "http://h/");

        assert!(!PublicationStage::new().execute(&mut state).await.unwrap());
        assert!(!server.exists());
        assert!(state.download_url.is_none());
    }

    #[tokio::test]
    async fn test_output_missing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_publishing_to(&dir.path().join("server"), "http://h/");
        state.output_file = Some(dir.path().join("gone.img.xz"));

        let err = PublicationStage::locate_output(&state).unwrap_err();
        assert!(err.to_string().contains("output file does not exist"));
        assert!(!PublicationStage::new().execute(&mut state).await.unwrap());
    }

    #[tokio::test]
    async fn test_publishes_copy_with_url() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("base.img.xz");
        std::fs::write(&output, b"compressed image").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&output)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let server = dir.path().join("srv/images");
        let mut state = state_publishing_to(&server, "https://img.example.com/hives");
        state.output_file = Some(output.clone());

        assert!(PublicationStage::new().execute(&mut state).await.unwrap());

        // copied, not moved
        assert!(output.is_file());
        let published = state.published_image_path.clone().unwrap();
        assert_eq!(published.parent().unwrap(), server.as_path());
        let name = published.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_apiary-07_1.4.0_image.xz"));
        assert_eq!(
            state.download_url.as_deref(),
            Some(format!("https://img.example.com/hives/{name}").as_str())
        );
        assert_eq!(std::fs::read(&published).unwrap(), b"compressed image");

        let modified = std::fs::metadata(&published).unwrap().modified().unwrap();
        let drift = modified
            .duration_since(past)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2));
        assert!(!partial_path(&published).exists());
    }

    #[tokio::test]
    async fn test_copy_from_missing_source_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("published.xz");

        let result = copy_preserving(&dir.path().join("absent.xz"), &target).await;
        assert!(result.is_err());
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_failed_rename_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("base.img.xz");
        std::fs::write(&source, b"compressed image").unwrap();
        // a non-empty directory cannot be replaced by a file
        let target = dir.path().join("published.xz");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        assert!(copy_preserving(&source, &target).await.is_err());
        assert!(!partial_path(&target).exists());
        assert!(target.join("occupied").is_dir());
    }

    #[test]
    fn test_file_name_format() {
        let stamp = crate::utils::publish_stamp(
            &chrono::NaiveDate::from_ymd_opt(2025, 3, 1)
                .unwrap()
                .and_hms_opt(14, 5, 9)
                .unwrap()
                .and_utc(),
        );
        assert_eq!(
            published_file_name(&stamp, "h1", "2.0"),
            "2025-03-01_14-05_h1_2.0_image.xz"
        );
    }
}
