//! Step attempt history types.
//!
//! Every invocation of a step executor is recorded as exactly one immutable
//! `StepAttempt`. The history store only ever appends these records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::OutputDelta;

/// Failure description reported by an executor or produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable failure code (e.g. "rate_limited", "timeout").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt outcome and role
// ---------------------------------------------------------------------------

/// Recorded result of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
    Timeout,
    /// Marker after the fatal attempt of a step whose error policy said to
    /// continue.
    Skipped,
    /// The run was cancelled while this step was current.
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RetryableFailure => "retryable_failure",
            AttemptOutcome::FatalFailure => "fatal_failure",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Skipped => "skipped",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }

    /// Outcomes after which the run may move on to the next step.
    pub fn completes_step(&self) -> bool {
        matches!(self, AttemptOutcome::Success | AttemptOutcome::Skipped)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "retryable_failure" => Ok(AttemptOutcome::RetryableFailure),
            "fatal_failure" => Ok(AttemptOutcome::FatalFailure),
            "timeout" => Ok(AttemptOutcome::Timeout),
            "skipped" => Ok(AttemptOutcome::Skipped),
            "cancelled" => Ok(AttemptOutcome::Cancelled),
            other => Err(format!("invalid attempt outcome: '{other}'")),
        }
    }
}

/// Whether an attempt ran a workflow step or its compensating step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptRole {
    #[default]
    Step,
    Compensation,
}

impl AttemptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptRole::Step => "step",
            AttemptRole::Compensation => "compensation",
        }
    }
}

impl FromStr for AttemptRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(AttemptRole::Step),
            "compensation" => Ok(AttemptRole::Compensation),
            other => Err(format!("invalid attempt role: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step attempt
// ---------------------------------------------------------------------------

/// One immutable history record.
///
/// Keyed by `(run_id, step_name, attempt_number)`; `attempt_number` is
/// 1-based and gap-free for each step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub run_id: Uuid,
    pub step_name: String,
    /// Position of the owning workflow step (compensations share it).
    pub step_index: usize,
    pub attempt_number: u32,
    #[serde(default)]
    pub role: AttemptRole,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    /// Keys written to the context. Empty for anything but a success.
    #[serde(default)]
    pub output_delta: OutputDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

impl StepAttempt {
    pub fn is_compensation(&self) -> bool {
        self.role == AttemptRole::Compensation
    }
}
