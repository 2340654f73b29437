//! The step executor boundary: what the engine hands an executor and what it
//! gets back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{ContextSnapshot, OutputDelta};
use crate::history::ErrorDetail;
use crate::workflow::StepSpec;

/// Everything an executor needs to run one attempt of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub step: StepSpec,
    /// 1-based attempt number for this step.
    pub attempt_number: u32,
    /// Context as of the moment the attempt started.
    pub context: ContextSnapshot,
    /// The engine abandons the attempt after this long.
    pub timeout_ms: u64,
}

/// Closed set of results an executor can report.
///
/// Business-level rejections are `FatalFailure` values, never panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: OutputDelta },
    RetryableFailure { error: ErrorDetail },
    FatalFailure { error: ErrorDetail },
}

impl StepOutcome {
    pub fn success(output: OutputDelta) -> Self {
        StepOutcome::Success { output }
    }

    pub fn retryable(error: ErrorDetail) -> Self {
        StepOutcome::RetryableFailure { error }
    }

    pub fn fatal(error: ErrorDetail) -> Self {
        StepOutcome::FatalFailure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}
