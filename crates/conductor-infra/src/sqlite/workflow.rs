//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `conductor-core` using sqlx with split
//! read/write pools. Definitions are stored as immutable JSON blobs keyed by
//! `(id, version)`. Runs are stored column-per-field so the scheduler can
//! query due runs without decoding them.

use chrono::{DateTime, Utc};
use conductor_core::repository::workflow::WorkflowRepository;
use conductor_types::context::ExecutionContext;
use conductor_types::error::RepositoryError;
use conductor_types::run::{Run, RunFailure, RunStatus};
use conductor_types::workflow::{WorkflowDefinition, WorkflowRef};
use sqlx::Row;
use uuid::Uuid;

use super::codec::{
    format_datetime, from_json, insert_error, parse_datetime, parse_uuid, query_error, to_json,
};
use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// `NotFound` unless the run exists. Reads through the writer so it sees
    /// the write that just missed.
    async fn ensure_run_exists(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        let exists = sqlx::query("SELECT 1 FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?
            .is_some();

        if exists {
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    workflow_version: i64,
    status: String,
    current_step_index: i64,
    current_attempt: i64,
    next_retry_at: Option<String>,
    cancel_requested: bool,
    last_error: Option<String>,
    context: String,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            current_attempt: row.try_get("current_attempt")?,
            next_retry_at: row.try_get("next_retry_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            last_error: row.try_get("last_error")?,
            context: row.try_get("context")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;

        let last_error = self
            .last_error
            .as_deref()
            .map(|s| from_json::<RunFailure>(s, "last_error"))
            .transpose()?;

        let context = ExecutionContext::from_json(from_json(&self.context, "context")?)
            .map_err(|e| RepositoryError::Query(format!("invalid context: {e}")))?;

        Ok(Run {
            run_id: parse_uuid(&self.run_id)?,
            workflow: WorkflowRef::new(self.workflow_id, self.workflow_version as u32),
            status,
            current_step_index: self.current_step_index as usize,
            current_attempt: self.current_attempt as u32,
            next_retry_at: self
                .next_retry_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            cancel_requested: self.cancel_requested,
            last_error,
            context,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn decode_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Run>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = RunRow::from_row(row).map_err(query_error)?;
        runs.push(r.into_run()?);
    }
    Ok(runs)
}

fn decode_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let body: String = row.try_get("definition").map_err(query_error)?;
    from_json(&body, "workflow definition")
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def, "definition")?;

        sqlx::query(
            "INSERT INTO workflow_definitions (id, version, definition, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&def.id)
        .bind(def.version as i64)
        .bind(&definition_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            insert_error(e, || {
                format!("workflow definition {} already exists", def.workflow_ref())
            })
        })?;

        Ok(())
    }

    async fn get_definition(
        &self,
        workflow: &WorkflowRef,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?")
            .bind(&workflow.id)
            .bind(workflow.version as i64)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode_definition).transpose()
    }

    async fn latest_definition(
        &self,
        id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(decode_definition).transpose()
    }

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let last_error = run
            .last_error
            .as_ref()
            .map(|f| to_json(f, "last_error"))
            .transpose()?;
        let context = to_json(&run.context, "context")?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_id, workflow_version, status, current_step_index,
                current_attempt, next_retry_at, cancel_requested, last_error, context,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow.id)
        .bind(run.workflow.version as i64)
        .bind(run.status.as_str())
        .bind(run.current_step_index as i64)
        .bind(run.current_attempt as i64)
        .bind(run.next_retry_at.as_ref().map(format_datetime))
        .bind(run.cancel_requested)
        .bind(&last_error)
        .bind(&context)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, || format!("run {} already exists", run.run_id)))?;

        Ok(())
    }

    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let last_error = run
            .last_error
            .as_ref()
            .map(|f| to_json(f, "last_error"))
            .transpose()?;
        let context = to_json(&run.context, "context")?;

        // A cancel flag set concurrently through request_cancel survives.
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?,
                 current_step_index = ?,
                 current_attempt = ?,
                 next_retry_at = ?,
                 cancel_requested = MAX(cancel_requested, ?),
                 last_error = ?,
                 context = ?,
                 updated_at = ?
               WHERE run_id = ?"#,
        )
        .bind(run.status.as_str())
        .bind(run.current_step_index as i64)
        .bind(run.current_attempt as i64)
        .bind(run.next_retry_at.as_ref().map(format_datetime))
        .bind(run.cancel_requested)
        .bind(&last_error)
        .bind(&context)
        .bind(format_datetime(&run.updated_at))
        .bind(run.run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn request_cancel(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET cancel_requested = 1, updated_at = ?
               WHERE run_id = ? AND status NOT IN ('completed', 'failed')"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_run_exists(run_id).await?;
        Ok(false)
    }

    async fn list_runnable_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE status NOT IN ('completed', 'failed')
                 AND (status != 'step_retry_wait'
                      OR next_retry_at IS NULL
                      OR next_retry_at <= ?
                      OR cancel_requested = 1)
               ORDER BY created_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        decode_runs(&rows)
    }

    async fn try_acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET lease_holder = ?, lease_expires_at = ?
               WHERE run_id = ?
                 AND (lease_holder IS NULL
                      OR lease_holder = ?
                      OR lease_expires_at IS NULL
                      OR lease_expires_at <= ?)"#,
        )
        .bind(holder)
        .bind(format_datetime(&expires_at))
        .bind(run_id.to_string())
        .bind(holder)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.ensure_run_exists(run_id).await?;
        Ok(false)
    }

    async fn release_lease(&self, run_id: &Uuid, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"UPDATE workflow_runs SET lease_holder = NULL, lease_expires_at = NULL
               WHERE run_id = ? AND lease_holder = ?"#,
        )
        .bind(run_id.to_string())
        .bind(holder)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }
}
