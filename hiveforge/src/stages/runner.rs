//! Stage lifecycle wrapper.

use super::BuildStage;
use crate::context::{PipelineState, StageScratch};
use crate::errors::BuildError;
use crate::pipeline::{CircuitBreaker, CircuitBreakerConfig};
use crate::utils::iso_timestamp;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs one stage through pre-run, guarded execution and post-run.
///
/// The runner owns the stage's circuit breaker and scratch area, so they
/// survive across repeated runs of the same stage within a build.
#[derive(Debug)]
pub struct StageRunner {
    stage: Box<dyn BuildStage>,
    breaker: CircuitBreaker,
    scratch: StageScratch,
    started: Option<Instant>,
}

impl StageRunner {
    /// Wraps `stage` with a fresh breaker.
    #[must_use]
    pub fn new(stage: Box<dyn BuildStage>, breaker: &CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(stage.name(), breaker);
        Self {
            stage,
            breaker,
            scratch: StageScratch::new(),
            started: None,
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Returns the stage's circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the stage's scratch area.
    #[must_use]
    pub fn scratch(&self) -> &StageScratch {
        &self.scratch
    }

    /// Runs the stage. Never panics and never returns an error.
    pub async fn run(&mut self, state: &mut PipelineState) -> bool {
        let span = info_span!("stage", stage = %self.stage.name(), build_id = %state.build_id);

        async {
            let success = if self.pre_run(state) {
                self.guarded_execute(state).await
            } else {
                false
            };
            self.post_run(state, success);
            success
        }
        .instrument(span)
        .await
    }

    fn pre_run(&mut self, state: &PipelineState) -> bool {
        self.started = Some(Instant::now());
        self.scratch.set("started_at", json!(iso_timestamp()));
        self.scratch.remove("last_error");
        info!("Starting stage");

        match self.stage.check_preconditions(state) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, category = %e.category(), "Stage pre-run check failed");
                self.scratch.set("last_error", json!(e.to_string()));
                false
            }
        }
    }

    async fn guarded_execute(&mut self, state: &mut PipelineState) -> bool {
        let stage = &*self.stage;
        let result = self
            .breaker
            .call(move || async move {
                AssertUnwindSafe(stage.execute(state))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(BuildError::Unexpected(panic_message(&*panic))))
            })
            .await;

        match result {
            Ok(true) => true,
            Ok(false) => {
                warn!("Stage reported failure");
                false
            }
            Err(e) if e.is_circuit_open() => {
                error!(error = %e, "Circuit breaker open, stage not executed");
                self.scratch.set("last_error", json!(e.to_string()));
                false
            }
            Err(e) => {
                error!(error = %e, category = %e.category(), "Stage execution failed");
                debug!(error = ?e, "Stage failure detail");
                self.scratch.set("last_error", json!(e.to_string()));
                false
            }
        }
    }

    fn post_run(&mut self, state: &mut PipelineState, success: bool) {
        let duration_ms = self
            .started
            .take()
            .map_or(0.0, |started| started.elapsed().as_secs_f64() * 1000.0);
        self.scratch.set("duration_ms", json!(duration_ms));

        if success {
            state.completed_stages.push(self.stage.name().to_string());
            info!(duration_ms, "Stage completed");
        } else {
            error!(
                duration_ms,
                failures = self.breaker.failure_count(),
                "Stage failed"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("stage panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("stage panicked: {s}")
    } else {
        "stage panicked".to_string()
    }
}
