//! Cooperative driver loops on top of `Orchestrator::advance`.
//!
//! The orchestrator itself never runs anything in the background. The
//! scheduler owns the loops a host process needs: driving one run to a
//! terminal state, driving many runs concurrently under a semaphore, and a
//! `tick` that sweeps every due run once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_types::run::Run;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::repository::history::HistoryStore;
use crate::repository::workflow::WorkflowRepository;

use super::engine::{EngineError, Orchestrator};

/// Default number of runs advanced concurrently.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;

/// Pause before retrying an `advance` that hit a lease conflict.
const LEASE_BACKOFF: Duration = Duration::from_millis(10);

/// Result of one `tick` sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    /// Runs that were due and got advanced.
    pub advanced: usize,
    /// Runs held by another caller and skipped.
    pub conflicts: usize,
    /// Runs whose `advance` returned any other error.
    pub errors: usize,
    /// Runs that reached a terminal status during this sweep.
    pub finished: usize,
}

/// Drives runs through an `Orchestrator`.
pub struct RunScheduler<R: WorkflowRepository, H: HistoryStore> {
    orchestrator: Arc<Orchestrator<R, H>>,
    permits: Arc<Semaphore>,
}

impl<R: WorkflowRepository, H: HistoryStore> Clone for RunScheduler<R, H> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<R, H> RunScheduler<R, H>
where
    R: WorkflowRepository + 'static,
    H: HistoryStore + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<R, H>>, max_concurrent_runs: usize) -> Self {
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<R, H>> {
        &self.orchestrator
    }

    /// Advance `run_id` until it is terminal, sleeping through retry waits.
    pub async fn drive(&self, run_id: Uuid) -> Result<Run, EngineError> {
        loop {
            let run = match self.orchestrator.advance(run_id).await {
                Ok(run) => run,
                Err(EngineError::LeaseConflict(_)) => {
                    tokio::time::sleep(LEASE_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if run.status.is_terminal() {
                return Ok(run);
            }

            if !run.cancel_requested {
                if let Some(at) = run.next_retry_at {
                    let wait = (at - Utc::now()).to_std().unwrap_or_default();
                    if !wait.is_zero() {
                        tracing::debug!(
                            run_id = %run_id,
                            wait_ms = wait.as_millis() as u64,
                            "waiting for retry"
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }

    /// Drive several runs to completion, at most `max_concurrent_runs` at a time.
    pub async fn drive_many(&self, run_ids: Vec<Uuid>) -> Vec<(Uuid, Result<Run, EngineError>)> {
        let mut set = JoinSet::new();

        for run_id in run_ids {
            let scheduler = self.clone();
            set.spawn(async move {
                let _permit = scheduler.permits.clone().acquire_owned().await.ok();
                (run_id, scheduler.drive(run_id).await)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "run driver task failed"),
            }
        }
        results
    }

    /// Advance every due run once, concurrently.
    pub async fn tick(&self, limit: u32) -> Result<TickSummary, EngineError> {
        let due = self
            .orchestrator
            .checkpoint()
            .repo()
            .list_runnable_runs(Utc::now(), limit)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let mut set = JoinSet::new();
        for run in due {
            let scheduler = self.clone();
            set.spawn(async move {
                let _permit = scheduler.permits.clone().acquire_owned().await.ok();
                (run.run_id, scheduler.orchestrator.advance(run.run_id).await)
            });
        }

        let mut summary = TickSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(run))) => {
                    summary.advanced += 1;
                    if run.status.is_terminal() {
                        summary.finished += 1;
                    }
                }
                Ok((run_id, Err(e))) if e.is_lease_conflict() => {
                    tracing::debug!(run_id = %run_id, "run busy, skipped this tick");
                    summary.conflicts += 1;
                }
                Ok((run_id, Err(e))) => {
                    tracing::warn!(run_id = %run_id, error = %e, "advance failed during tick");
                    summary.errors += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "tick task failed");
                    summary.errors += 1;
                }
            }
        }

        if summary.advanced > 0 || summary.errors > 0 {
            tracing::debug!(
                advanced = summary.advanced,
                finished = summary.finished,
                conflicts = summary.conflicts,
                errors = summary.errors,
                "scheduler tick"
            );
        }
        Ok(summary)
    }
}
