//! Event types for the Conductor engine event bus.
//!
//! `EngineEvent` is broadcast as runs move through the state machine. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunFailure;
use crate::workflow::WorkflowRef;

/// Lifecycle events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run was created.
    RunStarted { run_id: Uuid, workflow: WorkflowRef },

    /// An executor was invoked for a step.
    StepStarted {
        run_id: Uuid,
        step_name: String,
        attempt_number: u32,
    },

    /// A step succeeded and its output was merged.
    StepSucceeded {
        run_id: Uuid,
        step_name: String,
        attempt_number: u32,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        run_id: Uuid,
        step_name: String,
        attempt_number: u32,
        error: String,
        will_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_retry_at: Option<DateTime<Utc>>,
    },

    /// A step failed for good and was skipped under a continue policy.
    StepSkipped { run_id: Uuid, step_name: String },

    /// A compensating step ran after a failure.
    CompensationRan {
        run_id: Uuid,
        step_name: String,
        compensation: String,
        succeeded: bool,
    },

    /// Every step completed or was skipped.
    RunCompleted { run_id: Uuid, duration_ms: u64 },

    /// The run reached `Failed`.
    RunFailed {
        run_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<RunFailure>,
        cancelled: bool,
    },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepSucceeded { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::CompensationRan { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::RunCompleted { .. } | EngineEvent::RunFailed { .. }
        )
    }
}
