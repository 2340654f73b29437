//! Durable checkpoint manager for run state and attempt history.
//!
//! Wraps `WorkflowRepository` and `HistoryStore` behind one higher-level API.
//! The orchestrator appends every attempt here before it saves the run, so a
//! crash between the two is always recoverable from history.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use conductor_types::error::RepositoryError;
use conductor_types::history::{AttemptRole, StepAttempt};
use conductor_types::run::Run;
use conductor_types::workflow::{WorkflowDefinition, WorkflowRef};
use uuid::Uuid;

use crate::repository::history::HistoryStore;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for runs.
///
/// Generic over the storage ports so it works with any backend (SQLite,
/// in-memory, test doubles).
pub struct CheckpointManager<R: WorkflowRepository, H: HistoryStore> {
    repo: R,
    history: H,
}

impl<R: WorkflowRepository, H: HistoryStore> CheckpointManager<R, H> {
    pub fn new(repo: R, history: H) -> Self {
        Self { repo, history }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Access the underlying history store.
    pub fn history(&self) -> &H {
        &self.history
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn load_definition(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowDefinition>, CheckpointError> {
        self.repo
            .get_definition(workflow)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn load_run(&self, run_id: Uuid) -> Result<Run, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn save_run(&self, run: &Run) -> Result<(), CheckpointError> {
        self.repo
            .save_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.run_id,
            status = %run.status,
            step_index = run.current_step_index,
            attempt = run.current_attempt,
            "checkpointed run"
        );
        Ok(())
    }

    /// Take or renew the storage lease on a run for `ttl`.
    pub async fn acquire_lease(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let now = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.repo
            .try_acquire_lease(&run_id, holder, now, expires_at)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => CheckpointError::RunNotFound(run_id),
                other => CheckpointError::Repository(other.to_string()),
            })
    }

    pub async fn release_lease(&self, run_id: Uuid, holder: &str) -> Result<(), CheckpointError> {
        self.repo
            .release_lease(&run_id, holder)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Attempt history
    // -----------------------------------------------------------------------

    /// Durably record a finished attempt.
    pub async fn record_attempt(&self, attempt: &StepAttempt) -> Result<(), CheckpointError> {
        self.history
            .append(attempt)
            .await
            .map_err(|e| CheckpointError::History(e.to_string()))?;

        tracing::debug!(
            run_id = %attempt.run_id,
            step = %attempt.step_name,
            attempt = attempt.attempt_number,
            outcome = %attempt.outcome,
            role = attempt.role.as_str(),
            "recorded step attempt"
        );
        Ok(())
    }

    pub async fn list_attempts(&self, run_id: Uuid) -> Result<Vec<StepAttempt>, CheckpointError> {
        self.history
            .list_attempts(&run_id)
            .await
            .map_err(|e| CheckpointError::History(e.to_string()))
    }

    /// Attempts of the workflow step at `step_index`, compensations excluded,
    /// in attempt order.
    pub async fn step_attempts(
        &self,
        run_id: Uuid,
        step_index: usize,
    ) -> Result<Vec<StepAttempt>, CheckpointError> {
        let mut attempts: Vec<StepAttempt> = self
            .list_attempts(run_id)
            .await?
            .into_iter()
            .filter(|a| a.step_index == step_index && a.role == AttemptRole::Step)
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    /// Whether a compensation was already recorded for the step at `step_index`.
    pub async fn has_compensation(
        &self,
        run_id: Uuid,
        step_index: usize,
    ) -> Result<bool, CheckpointError> {
        Ok(self
            .list_attempts(run_id)
            .await?
            .iter()
            .any(|a| a.step_index == step_index && a.role == AttemptRole::Compensation))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Run/definition repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// History append or query failed.
    #[error("history store error: {0}")]
    History(String),

    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
