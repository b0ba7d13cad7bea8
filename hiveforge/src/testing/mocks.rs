//! In-memory stand-ins for the image capabilities.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::{BuildError, BuildResult};
use crate::image::{ChecksumKind, ChecksumMap, ImageBuilder};
use crate::validation::{CategoryResult, ImageValidator, ValidationReport};

/// An [`ImageBuilder`] that works on plain files under a scratch directory.
///
/// Downloads, extraction and compression write small placeholder files.
/// Mounting creates the mount point; unmounting empties it again, as a real
/// unmount would. Every call is recorded as `"<method> <path>"`.
#[derive(Debug)]
pub struct FakeImageBuilder {
    root: PathBuf,
    calls: Mutex<Vec<String>>,
    unmounted: Mutex<Vec<PathBuf>>,
    fail_on: Option<&'static str>,
    checksum_matches: bool,
}

impl FakeImageBuilder {
    /// Creates a builder writing its files under `root`.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            calls: Mutex::new(Vec::new()),
            unmounted: Mutex::new(Vec::new()),
            fail_on: None,
            checksum_matches: true,
        }
    }

    /// Makes `method` fail with a build error.
    #[must_use]
    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_on = Some(method);
        self
    }

    /// Makes checksum verification report a mismatch.
    #[must_use]
    pub fn with_checksum_mismatch(mut self) -> Self {
        self.checksum_matches = false;
        self
    }

    /// Recorded calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Every path passed to `unmount_image`.
    #[must_use]
    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.unmounted.lock().clone()
    }

    fn record(&self, method: &'static str, path: &Path) -> BuildResult<()> {
        self.calls.lock().push(format!("{method} {}", path.display()));
        if self.fail_on == Some(method) {
            return Err(BuildError::Build(format!("{method} failed")));
        }
        Ok(())
    }

    fn write(path: &Path, contents: &[u8]) -> BuildResult<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(path.to_path_buf())
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn download_image(&self) -> BuildResult<PathBuf> {
        let path = self.root.join("downloads/base.img.xz");
        self.record("download_image", &path)?;
        Self::write(&path, b"compressed base image")
    }

    async fn verify_checksum(
        &self,
        path: &Path,
        _expected: &str,
        _kind: ChecksumKind,
    ) -> BuildResult<bool> {
        self.record("verify_checksum", path)?;
        Ok(self.checksum_matches)
    }

    async fn extract_image(&self, compressed: &Path) -> BuildResult<PathBuf> {
        self.record("extract_image", compressed)?;
        Self::write(&self.root.join("work/base.img"), b"raw base image")
    }

    async fn mount_partition(
        &self,
        _image: &Path,
        mount_point: &Path,
        _offset: u64,
    ) -> BuildResult<()> {
        self.record("mount_partition", mount_point)?;
        std::fs::create_dir_all(mount_point)?;
        Ok(())
    }

    async fn unmount_image(&self, mount_points: &[PathBuf]) -> BuildResult<()> {
        for point in mount_points {
            self.record("unmount_image", point)?;
            if point.is_dir() {
                std::fs::remove_dir_all(point)?;
                std::fs::create_dir(point)?;
            }
            self.unmounted.lock().push(point.clone());
        }
        Ok(())
    }

    async fn compress_image(&self, image: &Path) -> BuildResult<PathBuf> {
        self.record("compress_image", image)?;
        let mut output = image.as_os_str().to_owned();
        output.push(".xz");
        Self::write(Path::new(&output), b"compressed image")
    }

    async fn generate_checksum(&self, path: &Path) -> BuildResult<ChecksumMap> {
        self.record("generate_checksum", path)?;
        Ok(crate::image::file_digests_async(path, &ChecksumKind::ALL).await?)
    }
}

/// An [`ImageValidator`] returning a fixed verdict.
#[derive(Debug)]
pub struct FakeValidator {
    success: bool,
    report: ValidationReport,
    calls: Mutex<Vec<BTreeSet<String>>>,
}

impl FakeValidator {
    /// A validator that passes every requested category.
    #[must_use]
    pub fn passing() -> Self {
        Self {
            success: true,
            report: ValidationReport::default(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A validator that fails with `report`.
    #[must_use]
    pub fn failing(report: ValidationReport) -> Self {
        Self {
            success: false,
            report,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of validations run.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Categories requested by each call.
    #[must_use]
    pub fn requested_categories(&self) -> Vec<BTreeSet<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImageValidator for FakeValidator {
    async fn validate_image(
        &self,
        _image_path: Option<&Path>,
        _boot_mount: Option<&Path>,
        _root_mount: Option<&Path>,
        categories: &BTreeSet<String>,
    ) -> BuildResult<(bool, ValidationReport)> {
        self.calls.lock().push(categories.clone());

        let mut report = self.report.clone();
        if self.success {
            for category in categories {
                report
                    .validations
                    .entry(category.clone())
                    .or_insert_with(CategoryResult::passed);
            }
        }
        Ok((self.success, report))
    }
}
