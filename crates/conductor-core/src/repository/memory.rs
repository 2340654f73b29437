//! In-memory implementation of both repository ports.
//!
//! Backed by `DashMap`s behind an `Arc`, so clones share state. Useful for
//! tests and for embedding the engine without a database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_types::error::RepositoryError;
use conductor_types::history::StepAttempt;
use conductor_types::run::Run;
use conductor_types::workflow::{WorkflowDefinition, WorkflowRef};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::history::HistoryStore;
use super::workflow::WorkflowRepository;

#[derive(Default)]
struct Tables {
    definitions: DashMap<WorkflowRef, WorkflowDefinition>,
    runs: DashMap<Uuid, Run>,
    attempts: DashMap<Uuid, Vec<StepAttempt>>,
    /// Lease holder and expiry per run.
    leases: DashMap<Uuid, (String, DateTime<Utc>)>,
}

/// Shared in-memory store implementing `WorkflowRepository` and `HistoryStore`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored.
    pub fn run_count(&self) -> usize {
        self.tables.runs.len()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("definitions", &self.tables.definitions.len())
            .field("runs", &self.tables.runs.len())
            .finish()
    }
}

impl WorkflowRepository for InMemoryStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self.tables.definitions.entry(def.workflow_ref()) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "workflow definition {} already exists",
                def.workflow_ref()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(def.clone());
                Ok(())
            }
        }
    }

    async fn get_definition(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.tables.definitions.get(workflow).map(|d| d.clone()))
    }

    async fn latest_definition(
        &self,
        id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .tables
            .definitions
            .iter()
            .filter(|entry| entry.key().id == id)
            .max_by_key(|entry| entry.key().version)
            .map(|entry| entry.value().clone()))
    }

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        match self.tables.runs.entry(run.run_id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.run_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(())
            }
        }
    }

    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut stored = self
            .tables
            .runs
            .get_mut(&run.run_id)
            .ok_or(RepositoryError::NotFound)?;
        let cancel_requested = stored.cancel_requested || run.cancel_requested;
        *stored = run.clone();
        stored.cancel_requested = cancel_requested;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.tables.runs.get(run_id).map(|r| r.clone()))
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let mut stored = self
            .tables
            .runs
            .get_mut(run_id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status.is_terminal() {
            return Ok(false);
        }
        stored.cancel_requested = true;
        Ok(true)
    }

    async fn list_runnable_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let mut runs: Vec<Run> = self
            .tables
            .runs
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn try_acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        if !self.tables.runs.contains_key(run_id) {
            return Err(RepositoryError::NotFound);
        }
        match self.tables.leases.entry(*run_id) {
            Entry::Occupied(mut slot) => {
                let (current, until) = slot.get();
                if current != holder && *until > now {
                    return Ok(false);
                }
                slot.insert((holder.to_string(), expires_at));
            }
            Entry::Vacant(slot) => {
                slot.insert((holder.to_string(), expires_at));
            }
        }
        Ok(true)
    }

    async fn release_lease(&self, run_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        self.tables
            .leases
            .remove_if(run_id, |_, (current, _)| current == holder);
        Ok(())
    }
}

impl HistoryStore for InMemoryStore {
    async fn append(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let mut log = self.tables.attempts.entry(attempt.run_id).or_default();
        let duplicate = log.iter().any(|existing| {
            existing.step_name == attempt.step_name
                && existing.attempt_number == attempt.attempt_number
        });
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "attempt {} of step '{}' already recorded for run {}",
                attempt.attempt_number, attempt.step_name, attempt.run_id
            )));
        }
        log.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, run_id: &Uuid) -> Result<Vec<StepAttempt>, RepositoryError> {
        let mut attempts = self
            .tables
            .attempts
            .get(run_id)
            .map(|log| log.clone())
            .unwrap_or_default();
        // Stable: append order is kept within a step.
        attempts.sort_by_key(|a| a.step_index);
        Ok(attempts)
    }
}
