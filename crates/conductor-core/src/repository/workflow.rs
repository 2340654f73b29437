//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions and runs. The
//! infrastructure layer (conductor-infra) implements this trait with SQLite
//! persistence.

use chrono::{DateTime, Utc};
use conductor_types::error::RepositoryError;
use conductor_types::run::Run;
use conductor_types::workflow::{WorkflowDefinition, WorkflowRef};
use uuid::Uuid;

/// Repository trait for definitions and runs.
///
/// Covers two entity families:
/// - **Definitions:** immutable, keyed by `(id, version)`.
/// - **Runs:** created once, then rewritten by the state machine after every
///   transition. `cancel_requested` is the only field callers may set, and a
///   `save_run` never clears it.
/// - **Leases:** a per-run holder with an expiry, shared by every process
///   using the same store. `advance` holds one while it mutates a run.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a new definition. Fails with `Conflict` if `(id, version)` exists.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a definition by `(id, version)`.
    fn get_definition(
        &self,
        workflow: &WorkflowRef,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the highest stored version of a definition.
    fn latest_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run record.
    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite the engine-owned fields of an existing run.
    ///
    /// Fails with `NotFound` if the run does not exist. A stored
    /// `cancel_requested = true` survives the write.
    fn save_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// Set `cancel_requested` on a non-terminal run.
    ///
    /// Returns `false` when the run is already terminal (nothing to cancel).
    /// Fails with `NotFound` if the run does not exist.
    fn request_cancel(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Non-terminal runs that `advance` would act on at `now`: not waiting on
    /// a future retry, or flagged for cancellation. Oldest first.
    fn list_runnable_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Take the run's lease for `holder` until `expires_at`, or renew it if
    /// `holder` already has it.
    ///
    /// Returns `false` while a different holder's lease is unexpired at
    /// `now`. Fails with `NotFound` if the run does not exist.
    fn try_acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the run's lease if `holder` has it. Otherwise a no-op.
    fn release_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
