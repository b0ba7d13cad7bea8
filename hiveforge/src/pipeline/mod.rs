//! Build orchestration.
//!
//! This module provides:
//! - The per-stage circuit breaker
//! - The work directory reservation
//! - The orchestrator that drives a build through its stages

mod circuit_breaker;
mod orchestrator;
mod reservation;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use orchestrator::{ArtifactType, BuildOrchestrator, BuildOutcome, BuildStatus};
pub use reservation::{MountReservation, MOUNT_LOCK_FILE};
