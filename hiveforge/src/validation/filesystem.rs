//! Validator that inspects mounted partitions directly.

use super::{
    CategoryResult, ImageValidator, ValidationReport, CATEGORY_FILES, CATEGORY_SERVICES,
    CATEGORY_STRUCTURE,
};
use crate::config::BuildConfig;
use crate::errors::BuildResult;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// Boot configuration files, any of which marks a usable boot partition.
pub const BOOT_CONFIG_FILES: &[&str] = &["config.txt", "cmdline.txt"];

/// Directories every root partition must contain.
pub const ROOTFS_REQUIRED_DIRS: &[&str] = &["etc", "usr"];

const UNIT_DIRS: &[&str] = &["etc/systemd/system", "lib/systemd/system", "usr/lib/systemd/system"];

/// Validates structure, required files and installed services of mounted partitions.
#[derive(Debug, Clone, Default)]
pub struct FilesystemValidator {
    required_files: Vec<String>,
    services: Vec<String>,
}

impl FilesystemValidator {
    /// Creates a validator from the build configuration.
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            required_files: config.build.required_files.clone(),
            services: config.software.services.clone(),
        }
    }

    /// Sets the files that must exist under the root partition.
    #[must_use]
    pub fn with_required_files(mut self, files: Vec<String>) -> Self {
        self.required_files = files;
        self
    }

    /// Sets the systemd units that must be installed.
    #[must_use]
    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    fn check_structure(
        image_path: Option<&Path>,
        boot: Option<&Path>,
        root: Option<&Path>,
    ) -> CategoryResult {
        let mut missing = Vec::new();
        let mut problems = Vec::new();

        if let Some(image) = image_path {
            match std::fs::metadata(image) {
                Ok(meta) if meta.len() == 0 => {
                    problems.push(format!("{} is empty", image.display()));
                }
                Ok(_) => {}
                Err(_) => missing.push(image.display().to_string()),
            }
        }

        match boot {
            Some(boot) => {
                if !BOOT_CONFIG_FILES.iter().any(|f| boot.join(f).is_file()) {
                    missing.push(boot.join(BOOT_CONFIG_FILES[0]).display().to_string());
                }
            }
            None => problems.push("boot partition is not mounted".to_string()),
        }

        match root {
            Some(root) => {
                for dir in ROOTFS_REQUIRED_DIRS {
                    let path = root.join(dir);
                    if !path.is_dir() {
                        missing.push(path.display().to_string());
                    }
                }
            }
            None => problems.push("root partition is not mounted".to_string()),
        }

        if missing.is_empty() && problems.is_empty() {
            return CategoryResult::passed();
        }
        if !missing.is_empty() {
            problems.push(format!("{} expected paths missing", missing.len()));
        }
        CategoryResult::failed(problems.join("; ")).with_missing_files(missing)
    }

    fn check_files(&self, root: Option<&Path>) -> CategoryResult {
        let Some(root) = root else {
            return CategoryResult::failed("root partition is not mounted");
        };

        let missing: Vec<String> = self
            .required_files
            .iter()
            .filter(|f| !root.join(f.trim_start_matches('/')).exists())
            .cloned()
            .collect();

        if missing.is_empty() {
            CategoryResult::passed().with_detail("checked", json!(self.required_files.len()))
        } else {
            CategoryResult::failed(format!("{} required files missing", missing.len()))
                .with_missing_files(missing)
        }
    }

    fn check_services(&self, root: Option<&Path>) -> CategoryResult {
        let Some(root) = root else {
            return CategoryResult::failed("root partition is not mounted");
        };

        let missing: Vec<String> = self
            .services
            .iter()
            .filter(|unit| !UNIT_DIRS.iter().any(|dir| root.join(dir).join(unit).exists()))
            .map(|unit| format!("{}/{unit}", UNIT_DIRS[0]))
            .collect();

        if missing.is_empty() {
            CategoryResult::passed().with_detail("services", json!(self.services))
        } else {
            CategoryResult::failed(format!("{} services not installed", missing.len()))
                .with_missing_files(missing)
        }
    }
}

#[async_trait]
impl ImageValidator for FilesystemValidator {
    async fn validate_image(
        &self,
        image_path: Option<&Path>,
        boot_mount: Option<&Path>,
        root_mount: Option<&Path>,
        categories: &BTreeSet<String>,
    ) -> BuildResult<(bool, ValidationReport)> {
        let mut report = ValidationReport::default();

        for category in categories {
            let result = match category.as_str() {
                CATEGORY_STRUCTURE => Self::check_structure(image_path, boot_mount, root_mount),
                CATEGORY_FILES => self.check_files(root_mount),
                CATEGORY_SERVICES => self.check_services(root_mount),
                other => CategoryResult::failed(format!("unknown validation category '{other}'")),
            };
            debug!(category = %category, success = result.success, "Validation category finished");
            report.validations.insert(category.clone(), result);
        }

        Ok((report.all_passed(), report))
    }
}
