//! Retry/backoff policy.
//!
//! Stateless and deterministic: the same `(policy, attempt, failure)` always
//! yields the same decision, and `RetryState` can be rebuilt from history
//! alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::history::{AttemptOutcome, AttemptRole, StepAttempt};
use conductor_types::run::Run;
use conductor_types::step::StepOutcome;
use conductor_types::workflow::{FailureKind, RetryPolicy, StepSpec, WorkflowDefinition};
use serde::Serialize;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the step again once this delay has elapsed.
    RetryAfter(Duration),
    /// No retries left (or the failure is fatal).
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler: all logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Decide whether a failure on `attempt_number` (1-based) is retried.
    pub fn decide(policy: &RetryPolicy, attempt_number: u32, kind: FailureKind) -> RetryDecision {
        if kind == FailureKind::Fatal || attempt_number > policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(Self::backoff_delay(policy, attempt_number))
    }

    /// `base_delay * multiplier^(attempt_number - 1)`, capped at `max_delay`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.base_delay_ms as f64 * policy.multiplier.powi(exponent);
        let cap = policy.max_delay_ms as f64;
        let millis = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// When the next attempt becomes due. Always strictly after `finished_at`.
    pub fn next_retry_at(finished_at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX).max(1);
        finished_at + chrono::Duration::milliseconds(millis)
    }

    /// Classify an executor outcome. `None` for a success.
    ///
    /// A retryable failure whose code is listed in the step's
    /// `fatal_error_codes` is treated as fatal.
    pub fn classify(step: &StepSpec, outcome: &StepOutcome) -> Option<FailureKind> {
        match outcome {
            StepOutcome::Success { .. } => None,
            StepOutcome::FatalFailure { .. } => Some(FailureKind::Fatal),
            StepOutcome::RetryableFailure { error } => {
                let listed = error
                    .code
                    .as_ref()
                    .is_some_and(|code| step.fatal_error_codes.iter().any(|c| c == code));
                Some(if listed {
                    FailureKind::Fatal
                } else {
                    FailureKind::Retryable
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RetryState
// ---------------------------------------------------------------------------

/// Retry bookkeeping for the current step, derived from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub step_name: String,
    pub attempts_so_far: u32,
    /// Set when the latest attempt failed and will be retried.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Rebuild the retry state of the run's current step.
    ///
    /// Returns `None` when the run has moved past its last step.
    pub fn from_history(
        run: &Run,
        definition: &WorkflowDefinition,
        attempts: &[StepAttempt],
    ) -> Option<Self> {
        let step = definition.step(run.current_step_index)?;
        let policy = definition.retry_policy_for(step);

        let mut step_attempts: Vec<&StepAttempt> = attempts
            .iter()
            .filter(|a| {
                a.role == AttemptRole::Step
                    && a.step_index == run.current_step_index
                    && a.step_name == step.name
            })
            .collect();
        step_attempts.sort_by_key(|a| a.attempt_number);

        let latest = step_attempts.last();
        let next_retry_at = latest.and_then(|a| {
            let waiting = matches!(
                a.outcome,
                AttemptOutcome::RetryableFailure | AttemptOutcome::Timeout
            );
            let finished_at = a.finished_at?;
            waiting.then(|| {
                RetryHandler::next_retry_at(
                    finished_at,
                    RetryHandler::backoff_delay(policy, a.attempt_number),
                )
            })
        });

        Some(Self {
            step_name: step.name.clone(),
            attempts_so_far: latest.map_or(0, |a| a.attempt_number),
            next_retry_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
