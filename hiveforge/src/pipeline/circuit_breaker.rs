//! Per-stage circuit breaker.
//!
//! After `failure_threshold` consecutive failures the breaker opens and
//! rejects calls without running them. Once `recovery_timeout` has passed
//! since the last failure, a single trial call is let through: success
//! closes the breaker, failure opens it again.

use crate::errors::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker (>= 1).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to wait before a trial call (>= 0).
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout() -> f64 {
    60.0
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs: recovery_timeout.as_secs_f64(),
        }
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold < 1 {
            return Err("circuit_breaker.failure_threshold must be >= 1".to_string());
        }
        if !self.recovery_timeout_secs.is_finite() || self.recovery_timeout_secs < 0.0 {
            return Err("circuit_breaker.recovery_timeout_secs must be >= 0".to_string());
        }
        Ok(())
    }

    /// Recovery timeout as a [`Duration`].
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

/// Failure-isolation guard owned by one stage.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
        }
    }

    /// Name of the guarded stage.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, accounting for an elapsed recovery timeout.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state {
            CircuitState::Open if self.remaining_timeout().is_zero() => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Consecutive failures recorded so far.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    fn remaining_timeout(&self) -> Duration {
        self.last_failure.map_or(Duration::ZERO, |at| {
            self.recovery_timeout.saturating_sub(at.elapsed())
        })
    }

    /// Checks whether a call may proceed, moving an expired open breaker to half-open.
    pub fn try_acquire(&mut self) -> BuildResult<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if self.state == CircuitState::Open {
                    info!(stage = %self.name, "Circuit breaker half-open, allowing trial call");
                }
                self.state = CircuitState::HalfOpen;
                Ok(())
            }
            CircuitState::Open => Err(BuildError::CircuitOpen {
                stage: self.name.clone(),
                retry_in: self.remaining_timeout(),
            }),
        }
    }

    /// Records a successful call.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(stage = %self.name, "Circuit breaker closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }

    /// Records a failed call.
    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());

        if self.state == CircuitState::HalfOpen {
            warn!(stage = %self.name, "Trial call failed, circuit breaker reopened");
            self.state = CircuitState::Open;
        } else if self.failure_count >= self.failure_threshold {
            if self.state != CircuitState::Open {
                warn!(
                    stage = %self.name,
                    failures = self.failure_count,
                    recovery_timeout_secs = self.recovery_timeout.as_secs_f64(),
                    "Circuit breaker opened"
                );
            }
            self.state = CircuitState::Open;
        } else {
            debug!(
                stage = %self.name,
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker recorded failure"
            );
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// `Ok(true)` counts as success; `Ok(false)` and errors count as failures
    /// and are returned unchanged. An open breaker returns
    /// [`BuildError::CircuitOpen`] without calling `operation`.
    pub async fn call<F, Fut>(&mut self, operation: F) -> BuildResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BuildResult<bool>>,
    {
        self.try_acquire()?;

        let result = operation().await;
        match result {
            Ok(true) => self.record_success(),
            Ok(false) | Err(_) => self.record_failure(),
        }
        result
    }

    /// Closes the breaker and forgets all failures.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }
}
