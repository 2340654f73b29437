//! Run types: one execution instance of a workflow definition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::history::ErrorDetail;
use crate::workflow::WorkflowRef;

// ---------------------------------------------------------------------------
// Run Status
// ---------------------------------------------------------------------------

/// Position of a run in the orchestration state machine.
///
/// `Pending -> Running -> {StepExecuting <-> StepRetryWait} -> Completed | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    StepExecuting,
    StepRetryWait,
    Completed,
    Failed,
}

impl RunStatus {
    /// `Completed` and `Failed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::StepExecuting => "step_executing",
            RunStatus::StepRetryWait => "step_retry_wait",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "step_executing" => Ok(RunStatus::StepExecuting),
            "step_retry_wait" => Ok(RunStatus::StepRetryWait),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step_name: String,
    /// Number of attempts made at the failing step.
    pub attempt_number: u32,
    pub detail: ErrorDetail,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step '{}' failed after {} attempt(s): {}",
            self.step_name, self.attempt_number, self.detail
        )
    }
}

/// A single execution instance of a workflow.
///
/// Only the orchestration state machine mutates a run. The one exception is
/// `cancel_requested`, which callers set through the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    pub workflow: WorkflowRef,
    pub status: RunStatus,
    /// Index of the step to execute next (equals `steps.len()` once done).
    pub current_step_index: usize,
    /// Attempts already recorded for the current step.
    pub current_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunFailure>,
    pub context: ExecutionContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// A fresh `Pending` run at the first step.
    pub fn new(workflow: WorkflowRef, context: ExecutionContext) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7(),
            workflow,
            status: RunStatus::Pending,
            current_step_index: 0,
            current_attempt: 0,
            next_retry_at: None,
            cancel_requested: false,
            last_error: None,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `advance` would do anything at `now` besides return early.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.cancel_requested {
            return true;
        }
        match (self.status, self.next_retry_at) {
            (RunStatus::StepRetryWait, Some(at)) => at <= now,
            _ => true,
        }
    }
}

/// Caller-facing summary returned by `get_run_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Name of the current step; `None` once every step has been passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Attempts recorded for the current step.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}
