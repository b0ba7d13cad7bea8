//! Image validation capability and report types.

mod filesystem;

pub use filesystem::{FilesystemValidator, BOOT_CONFIG_FILES, ROOTFS_REQUIRED_DIRS};

use crate::errors::BuildResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Checks image layout and content.
pub const CATEGORY_STRUCTURE: &str = "structure";
/// Checks that required files exist in the root partition.
pub const CATEGORY_FILES: &str = "files";
/// Checks that configured systemd units are installed.
pub const CATEGORY_SERVICES: &str = "services";

/// Outcome of one validation category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryResult {
    /// Whether the category passed.
    pub success: bool,
    /// What went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Paths that were expected but absent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_files: Vec<String>,
    /// Category specific details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl CategoryResult {
    /// A passing result.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A failing result with an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attaches missing paths.
    #[must_use]
    pub fn with_missing_files(mut self, missing: Vec<String>) -> Self {
        self.missing_files = missing;
        self
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Structured report returned by an [`ImageValidator`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Per-category results.
    pub validations: BTreeMap<String, CategoryResult>,
}

impl ValidationReport {
    /// Returns true if every category passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.validations.values().all(|r| r.success)
    }

    /// Iterates over failing categories.
    pub fn failures(&self) -> impl Iterator<Item = (&String, &CategoryResult)> {
        self.validations.iter().filter(|(_, r)| !r.success)
    }
}

/// What the validation stage recorded in the pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationResults {
    /// Validation did not run.
    Skipped {
        /// Always true; mirrors the serialized `{skipped: true}` shape.
        skipped: bool,
        /// Why it was skipped.
        reason: String,
    },
    /// Validation ran.
    Completed {
        /// Overall outcome.
        success: bool,
        /// The full report.
        #[serde(flatten)]
        report: ValidationReport,
    },
}

impl ValidationResults {
    /// Builds a skipped marker.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            skipped: true,
            reason: reason.into(),
        }
    }

    /// Returns true if validation was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Structural and content validation of a prepared image.
#[async_trait]
pub trait ImageValidator: Send + Sync {
    /// Runs the requested categories and returns `(success, report)`.
    async fn validate_image(
        &self,
        image_path: Option<&Path>,
        boot_mount: Option<&Path>,
        root_mount: Option<&Path>,
        categories: &BTreeSet<String>,
    ) -> BuildResult<(bool, ValidationReport)>;
}
