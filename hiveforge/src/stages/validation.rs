//! Runs the configured validator against the prepared image.

use super::{BuildStage, VALIDATION};
use crate::context::PipelineState;
use crate::errors::BuildResult;
use crate::validation::{ImageValidator, ValidationReport, ValidationResults};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Validates the image unless validation is disabled.
pub struct ValidationStage {
    validator: Arc<dyn ImageValidator>,
}

impl std::fmt::Debug for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationStage").finish_non_exhaustive()
    }
}

impl ValidationStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(validator: Arc<dyn ImageValidator>) -> Self {
        Self { validator }
    }
}

/// One line per failing category, then one per missing file.
#[must_use]
pub fn failure_lines(report: &ValidationReport) -> Vec<String> {
    let mut lines = Vec::new();
    for (category, result) in report.failures() {
        lines.push(format!(
            "{category}: {}",
            result.error.as_deref().unwrap_or("failed")
        ));
        lines.extend(
            result
                .missing_files
                .iter()
                .map(|file| format!("{category}: missing {file}")),
        );
    }
    lines
}

#[async_trait]
impl BuildStage for ValidationStage {
    fn name(&self) -> &str {
        VALIDATION
    }

    async fn execute(&self, state: &mut PipelineState) -> BuildResult<bool> {
        let settings = &state.config.build;
        if settings.skip_validation {
            info!("Validation skipped by configuration");
            state.validation_results =
                Some(ValidationResults::skipped("skip_validation enabled"));
            return Ok(true);
        }

        let categories = settings.validation_categories.clone();
        info!(categories = ?categories, "Validating image");

        let (success, report) = self
            .validator
            .validate_image(
                state.image_path.as_deref(),
                state.boot_mount.as_deref(),
                state.root_mount.as_deref(),
                &categories,
            )
            .await?;

        if success {
            info!(categories = report.validations.len(), "Image validation passed");
        } else {
            error!("Image validation failed");
            for line in failure_lines(&report) {
                warn!("  {line}");
            }
        }

        state.validation_results = Some(ValidationResults::Completed { success, report });
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::testing::mocks::FakeValidator;
    use crate::validation::{CategoryResult, CATEGORY_FILES, CATEGORY_STRUCTURE};
    use pretty_assertions::assert_eq;

    fn failing_report() -> ValidationReport {
        let mut report = ValidationReport::default();
        report
            .validations
            .insert(CATEGORY_STRUCTURE.into(), CategoryResult::passed());
        report.validations.insert(
            CATEGORY_FILES.into(),
            CategoryResult::failed("2 required files missing")
                .with_missing_files(vec!["etc/fstab".into(), "etc/passwd".into()]),
        );
        report
    }

    #[tokio::test]
    async fn test_skip_records_marker_without_validating() {
        let validator = Arc::new(FakeValidator::passing());
        let mut config = BuildConfig::default();
        config.build.skip_validation = true;
        let mut state = PipelineState::new(Arc::new(config));

        let stage = ValidationStage::new(validator.clone());
        assert!(stage.execute(&mut state).await.unwrap());

        assert!(state.validation_results.as_ref().unwrap().is_skipped());
        assert_eq!(validator.calls(), 0);
    }

    #[tokio::test]
    async fn test_passing_validation() {
        let validator = Arc::new(FakeValidator::passing());
        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));

        let stage = ValidationStage::new(validator.clone());
        assert!(stage.execute(&mut state).await.unwrap());

        assert_eq!(validator.calls(), 1);
        assert!(matches!(
            state.validation_results,
            Some(ValidationResults::Completed { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_validation_reports_missing_files() {
        let validator = Arc::new(FakeValidator::failing(failing_report()));
        let mut state = PipelineState::new(Arc::new(BuildConfig::default()));

        let stage = ValidationStage::new(validator);
        assert!(!stage.execute(&mut state).await.unwrap());

        match state.validation_results {
            Some(ValidationResults::Completed { success, report }) => {
                assert!(!success);
                assert_eq!(
                    failure_lines(&report),
                    vec![
                        "files: 2 required files missing".to_string(),
                        "files: missing etc/fstab".to_string(),
                        "files: missing etc/passwd".to_string(),
                    ]
                );
            }
            other => panic!("unexpected results: {other:?}"),
        }
    }
}
