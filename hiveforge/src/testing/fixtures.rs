//! Filesystem fixtures for build tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::stages::CACHED_RAW_IMAGE;

/// Layout created by [`unpacked_image`].
#[derive(Debug, Clone)]
pub struct UnpackedImage {
    /// Directory holding `boot/`, `rootfs/` and the raw image.
    pub root_dir: PathBuf,
    /// Boot partition directory.
    pub boot: PathBuf,
    /// Root partition directory.
    pub root: PathBuf,
    /// Raw image next to the partitions.
    pub image: PathBuf,
}

/// Creates a minimal unpacked Raspberry Pi OS image under `dir`.
///
/// # Panics
///
/// Panics if the directory cannot be written.
#[allow(clippy::unwrap_used)]
pub fn unpacked_image(dir: &Path) -> UnpackedImage {
    let boot = dir.join("boot");
    let root = dir.join("rootfs");
    fs::create_dir_all(&boot).unwrap();
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::create_dir_all(root.join("usr/bin")).unwrap();
    fs::write(boot.join("config.txt"), "arm_64bit=1\n").unwrap();

    let image = dir.join(CACHED_RAW_IMAGE);
    fs::write(&image, b"raw image").unwrap();

    UnpackedImage {
        root_dir: dir.to_path_buf(),
        boot,
        root,
        image,
    }
}

/// A valid configuration whose every path lives under `dir`.
#[must_use]
pub fn build_config(dir: &Path) -> BuildConfig {
    let mut config = BuildConfig::default();
    config.hive.id = "test-hive".into();
    config.hive.version = "1.0.0".into();
    config.build.work_dir = dir.join("work");
    config.build.cache_dir = dir.join("cache");
    config.publication.server_base_path = Some(dir.join("server"));
    config.publication.download_url_base = Some("http://images.test/hives".into());
    config
}
