//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod history;
pub mod pool;
pub mod workflow;

mod codec;

pub use history::SqliteHistoryStore;
pub use pool::DatabasePool;
pub use workflow::SqliteWorkflowRepository;

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::event::EventBus;
    use conductor_core::repository::workflow::WorkflowRepository;
    use conductor_core::workflow::{ExecutorRegistry, Orchestrator, StepExecutor};
    use conductor_types::context::{ExecutionContext, OutputDelta};
    use conductor_types::history::AttemptOutcome;
    use conductor_types::run::RunStatus;
    use conductor_types::step::{StepOutcome, StepRequest};
    use conductor_types::workflow::{ErrorPolicy, RetryPolicy, StepSpec, WorkflowDefinition};
    use serde_json::json;
    use std::collections::HashMap;

    /// Adds one to the `count` context key.
    struct Increment;

    impl StepExecutor for Increment {
        async fn execute(&self, request: StepRequest) -> StepOutcome {
            let count = request.context.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut out = OutputDelta::new();
            out.insert("count".to_string(), json!(count + 1));
            StepOutcome::success(out)
        }
    }

    async fn orchestrator(
        pool: DatabasePool,
    ) -> Orchestrator<SqliteWorkflowRepository, SqliteHistoryStore> {
        Orchestrator::new(
            SqliteWorkflowRepository::new(pool.clone()),
            SqliteHistoryStore::new(pool),
            ExecutorRegistry::new().with("increment", Increment),
            EventBus::default(),
        )
    }

    fn counter_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "counter".to_string(),
            version: 1,
            description: None,
            steps: vec![
                StepSpec::new("one", "increment"),
                StepSpec::new("two", "increment"),
                StepSpec::new("three", "increment"),
            ],
            default_retry_policy: RetryPolicy::default(),
            default_error_policy: ErrorPolicy::Fail,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_run_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = pool::database_url_in(dir.path());
        let def = counter_definition();

        let run_id = {
            let orch = orchestrator(DatabasePool::new(&url).await.unwrap()).await;
            orch.register_definition(&def).await.unwrap();
            let run_id = orch
                .start_run(&def.workflow_ref(), ExecutionContext::new())
                .await
                .unwrap();
            orch.advance(run_id).await.unwrap();
            run_id
        };

        let orch = orchestrator(DatabasePool::new(&url).await.unwrap()).await;
        let mut run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.current_step_index, 2);
        while !run.status.is_terminal() {
            run = orch.advance(run_id).await.unwrap();
        }

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context.get("count"), Some(&json!(3)));

        let attempts = orch.list_attempts(run_id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Success));
    }

    #[tokio::test]
    async fn test_run_leased_by_another_process_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&pool::database_url_in(dir.path())).await.unwrap();
        let orch = orchestrator(pool.clone()).await;
        let def = counter_definition();
        orch.register_definition(&def).await.unwrap();
        let run_id = orch
            .start_run(&def.workflow_ref(), ExecutionContext::new())
            .await
            .unwrap();

        let other = SqliteWorkflowRepository::new(pool);
        let now = chrono::Utc::now();
        assert!(other
            .try_acquire_lease(&run_id, "other-process", now, now + chrono::Duration::seconds(60))
            .await
            .unwrap());

        let err = orch.advance(run_id).await.unwrap_err();
        assert!(err.is_lease_conflict());
        let run = other.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(orch.list_attempts(run_id).await.unwrap().is_empty());

        other.release_lease(&run_id, "other-process").await.unwrap();
        let run = orch.advance(run_id).await.unwrap();
        assert_eq!(run.current_step_index, 1);
    }
}
