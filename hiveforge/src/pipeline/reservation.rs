//! Exclusive use of a work directory's mount area.

use crate::errors::{BuildError, BuildResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock file name inside the work directory.
pub const MOUNT_LOCK_FILE: &str = ".mount.lock";

/// Advisory lock held for the whole build.
///
/// Two builds sharing a work directory would otherwise race for the same
/// loop devices and mount points. The lock is released when the guard is
/// dropped. The lock file itself is left in place.
#[derive(Debug)]
pub struct MountReservation {
    _file: File,
    path: PathBuf,
}

impl MountReservation {
    /// Takes the lock on `work_dir`, failing fast if another build holds it.
    pub fn acquire(work_dir: &Path) -> BuildResult<Self> {
        std::fs::create_dir_all(work_dir)?;
        let path = work_dir.join(MOUNT_LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(BuildError::Configuration(format!(
                "work directory {} is in use by another build",
                work_dir.display()
            )));
        }

        debug!(lock = %path.display(), "Mount reservation acquired");
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
