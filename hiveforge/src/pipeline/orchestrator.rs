//! Runs the stages of one build in order.

use super::MountReservation;
use crate::cancellation::CancellationToken;
use crate::config::BuildConfig;
use crate::context::PipelineState;
use crate::errors::BuildResult;
use crate::events::{BuildEvent, EventSink, NoOpEventSink};
use crate::image::ImageBuilder;
use crate::stages::{
    self, BuildStage, CompressionStage, DownloadStage, MountStage, ProvisionStage,
    PublicationStage, StageRunner, ValidationStage,
};
use crate::validation::ImageValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

/// Which artifact a build produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Compressed image published to the image server.
    #[default]
    Full,
    /// Compressed image left in the work directory.
    Local,
}

impl ArtifactType {
    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(self) -> &'static [&'static str] {
        static FULL: [&str; 6] = [
            stages::DOWNLOAD,
            stages::MOUNT,
            stages::PROVISION,
            stages::VALIDATION,
            stages::COMPRESSION,
            stages::PUBLICATION,
        ];
        match self {
            Self::Full => &FULL,
            Self::Local => &FULL[..5],
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// How a build ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    /// Every stage succeeded.
    Success,
    /// `stage` failed and later stages did not run.
    Failed {
        /// The failing stage.
        stage: String,
    },
    /// Cancellation was requested before a stage started.
    Interrupted {
        /// Cancellation reason.
        reason: String,
    },
}

impl BuildStatus {
    /// Process exit code for this status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed { .. } => 1,
            Self::Interrupted { .. } => 130,
        }
    }
}

/// Result of [`BuildOrchestrator::run`].
#[derive(Debug)]
pub struct BuildOutcome {
    /// How the build ended.
    pub status: BuildStatus,
    /// Final pipeline state.
    pub state: PipelineState,
    /// Total wall time.
    pub duration: Duration,
}

impl BuildOutcome {
    /// Returns true if every stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    /// Stages that completed, in order.
    #[must_use]
    pub fn completed_stages(&self) -> &[String] {
        &self.state.completed_stages
    }

    /// Process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Wires the stages to their capabilities and drives a build.
pub struct BuildOrchestrator {
    builder: Arc<dyn ImageBuilder>,
    validator: Arc<dyn ImageValidator>,
    event_sink: Arc<dyn EventSink>,
    cancellation: Arc<CancellationToken>,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl BuildOrchestrator {
    /// Creates an orchestrator with no event sink and a fresh token.
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>, validator: Arc<dyn ImageValidator>) -> Self {
        Self {
            builder,
            validator,
            event_sink: Arc::new(NoOpEventSink),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that interrupts this orchestrator's builds.
    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancellation)
    }

    fn stage(&self, name: &str) -> Option<Box<dyn BuildStage>> {
        let stage: Box<dyn BuildStage> = match name {
            stages::DOWNLOAD => Box::new(DownloadStage::new(Arc::clone(&self.builder))),
            stages::MOUNT => Box::new(MountStage::new(Arc::clone(&self.builder))),
            stages::PROVISION => Box::new(ProvisionStage::new(Arc::clone(&self.builder))),
            stages::VALIDATION => Box::new(ValidationStage::new(Arc::clone(&self.validator))),
            stages::COMPRESSION => Box::new(CompressionStage::new(Arc::clone(&self.builder))),
            stages::PUBLICATION => Box::new(PublicationStage::new()),
            _ => return None,
        };
        Some(stage)
    }

    fn runners(&self, config: &BuildConfig) -> Vec<StageRunner> {
        config
            .build
            .artifact_type
            .stage_names()
            .iter()
            .filter_map(|name| self.stage(name))
            .map(|stage| StageRunner::new(stage, &config.build.circuit_breaker))
            .collect()
    }

    /// Runs a build to completion.
    ///
    /// Stage failures are reported through [`BuildOutcome::status`]. An error
    /// is returned only when the build cannot start, e.g. because another
    /// build holds the work directory.
    pub async fn run(&self, config: Arc<BuildConfig>) -> BuildResult<BuildOutcome> {
        let _reservation = MountReservation::acquire(&config.build.work_dir)?;

        let mut state = PipelineState::new(Arc::clone(&config));
        if let Some(cached) = config.build.cached_unpacked_path.as_ref() {
            if cached.is_dir() {
                state.cached_unpacked_path = Some(cached.clone());
            } else {
                warn!(
                    cache = %cached.display(),
                    "Unpacked image cache not found, building from scratch"
                );
            }
        }

        let span = info_span!(
            "build",
            build_id = %state.build_id,
            hive_id = %config.hive.id,
            artifact = %config.build.artifact_type
        );
        Ok(self.drive(state, &config).instrument(span).await)
    }

    async fn drive(
        &self,
        mut state: PipelineState,
        config: &BuildConfig,
    ) -> BuildOutcome {
        let started = Instant::now();
        let mut runners = self.runners(config);

        info!(stages = runners.len(), "Build started");
        self.event_sink
            .emit(&BuildEvent::BuildStarted {
                build_id: state.build_id,
                hive_id: config.hive.id.clone(),
                stages: runners.iter().map(|r| r.name().to_string()).collect(),
            })
            .await;

        let mut status = BuildStatus::Success;
        for runner in &mut runners {
            if let Err(e) = self.cancellation.check() {
                warn!(error = %e, next_stage = runner.name(), "Build interrupted");
                status = BuildStatus::Interrupted {
                    reason: self.cancellation.reason().unwrap_or_default(),
                };
                break;
            }

            let stage = runner.name().to_string();
            self.event_sink
                .emit(&BuildEvent::StageStarted {
                    build_id: state.build_id,
                    stage: stage.clone(),
                })
                .await;

            if runner.run(&mut state).await {
                let duration_ms = runner
                    .scratch()
                    .get("duration_ms")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or_default();
                self.event_sink
                    .emit(&BuildEvent::StageCompleted {
                        build_id: state.build_id,
                        stage,
                        duration_ms,
                    })
                    .await;
            } else {
                self.event_sink
                    .emit(&BuildEvent::StageFailed {
                        build_id: state.build_id,
                        stage: stage.clone(),
                        error: runner.scratch().get_str("last_error").map(str::to_string),
                    })
                    .await;
                status = BuildStatus::Failed { stage };
                break;
            }
        }

        self.teardown(&mut state).await;

        let duration = started.elapsed();
        let duration_ms = duration.as_secs_f64() * 1000.0;
        match &status {
            BuildStatus::Success => info!(duration_ms, "Build succeeded"),
            BuildStatus::Failed { stage } => error!(duration_ms, stage = %stage, "Build failed"),
            BuildStatus::Interrupted { reason } => {
                self.event_sink
                    .emit(&BuildEvent::BuildInterrupted {
                        build_id: state.build_id,
                        reason: reason.clone(),
                    })
                    .await;
            }
        }
        self.event_sink
            .emit(&BuildEvent::BuildCompleted {
                build_id: state.build_id,
                success: status == BuildStatus::Success,
                duration_ms,
            })
            .await;

        BuildOutcome {
            status,
            state,
            duration,
        }
    }

    /// Releases partitions an aborted build left mounted.
    async fn teardown(&self, state: &mut PipelineState) {
        if state.mount_points().is_empty() {
            return;
        }

        if !state.config.build.unmount_on_abort {
            warn!(
                mounts = ?state.mount_points(),
                "Partitions left mounted, unmount_on_abort is disabled"
            );
            return;
        }

        let active = state.active_mounts();
        if !active.is_empty() {
            warn!(mounts = ?active, "Unmounting partitions left by an incomplete build");
            match self.builder.unmount_image(&active).await {
                Ok(()) => stages::remove_mount_dirs(&active).await,
                Err(e) => error!(error = %e, "Teardown unmount failed"),
            }
        }
        state.clear_mounts();
    }
}
