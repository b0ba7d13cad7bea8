//! Build lifecycle events.
//!
//! The orchestrator reports every build and stage transition to an
//! [`EventSink`]. Sinks are observers only; they cannot influence the build.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;
use uuid::Uuid;

/// A build or stage transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// The build began.
    #[serde(rename = "build.started")]
    BuildStarted {
        /// Build identifier.
        build_id: Uuid,
        /// Target hive.
        hive_id: String,
        /// Stages that will run, in order.
        stages: Vec<String>,
    },
    /// A stage began.
    #[serde(rename = "stage.started")]
    StageStarted {
        /// Build identifier.
        build_id: Uuid,
        /// Stage name.
        stage: String,
    },
    /// A stage succeeded.
    #[serde(rename = "stage.completed")]
    StageCompleted {
        /// Build identifier.
        build_id: Uuid,
        /// Stage name.
        stage: String,
        /// Wall time of the stage.
        duration_ms: f64,
    },
    /// A stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// Build identifier.
        build_id: Uuid,
        /// Stage name.
        stage: String,
        /// Last recorded error, if any.
        error: Option<String>,
    },
    /// The build stopped because cancellation was requested.
    #[serde(rename = "build.interrupted")]
    BuildInterrupted {
        /// Build identifier.
        build_id: Uuid,
        /// Cancellation reason.
        reason: String,
    },
    /// The build finished, successfully or not.
    #[serde(rename = "build.completed")]
    BuildCompleted {
        /// Build identifier.
        build_id: Uuid,
        /// Whether every stage succeeded.
        success: bool,
        /// Total wall time.
        duration_ms: f64,
    },
}

impl BuildEvent {
    /// Dotted event type, e.g. `stage.completed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build.started",
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageFailed { .. } => "stage.failed",
            Self::BuildInterrupted { .. } => "build.interrupted",
            Self::BuildCompleted { .. } => "build.completed",
        }
    }

    /// Build the event belongs to.
    #[must_use]
    pub fn build_id(&self) -> Uuid {
        match self {
            Self::BuildStarted { build_id, .. }
            | Self::StageStarted { build_id, .. }
            | Self::StageCompleted { build_id, .. }
            | Self::StageFailed { build_id, .. }
            | Self::BuildInterrupted { build_id, .. }
            | Self::BuildCompleted { build_id, .. } => *build_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_with_type_tag() {
        let id = Uuid::nil();
        let event = BuildEvent::StageFailed {
            build_id: id,
            stage: "mount".into(),
            error: Some("no loop device".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("stage.failed"));
        assert_eq!(value["stage"], json!("mount"));
        assert_eq!(event.event_type(), "stage.failed");
        assert_eq!(event.build_id(), id);
    }
}
