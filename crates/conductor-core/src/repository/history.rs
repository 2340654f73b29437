//! History store trait definition.

use conductor_types::error::RepositoryError;
use conductor_types::history::StepAttempt;
use uuid::Uuid;

/// Append-only log of step attempts keyed by run.
///
/// There is no update or delete. `append` fails only when the
/// backend is unavailable or `(run_id, step_name, attempt_number)` already
/// exists (`Conflict`), which the per-run lease makes unreachable in normal
/// operation.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait HistoryStore: Send + Sync {
    /// Durably record one finished attempt.
    fn append(
        &self,
        attempt: &StepAttempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All attempts of a run, ordered by step position, then append order.
    fn list_attempts(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepAttempt>, RepositoryError>> + Send;
}
