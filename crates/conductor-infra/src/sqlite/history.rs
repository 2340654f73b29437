//! SQLite attempt history.
//!
//! `step_attempts` is append-only: the schema rejects UPDATE and DELETE with
//! triggers, and a unique key on `(run_id, step_name, attempt_number)` turns a
//! duplicate append into `RepositoryError::Conflict`.

use conductor_core::repository::history::HistoryStore;
use conductor_types::context::OutputDelta;
use conductor_types::error::RepositoryError;
use conductor_types::history::{AttemptOutcome, AttemptRole, ErrorDetail, StepAttempt};
use sqlx::Row;
use uuid::Uuid;

use super::codec::{
    format_datetime, from_json, insert_error, parse_datetime, parse_uuid, query_error, to_json,
};
use super::pool::DatabasePool;

/// SQLite-backed implementation of `HistoryStore`.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: DatabasePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct AttemptRow {
    run_id: String,
    step_name: String,
    step_index: i64,
    attempt_number: i64,
    role: String,
    outcome: String,
    output_delta: String,
    error_detail: Option<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            step_index: row.try_get("step_index")?,
            attempt_number: row.try_get("attempt_number")?,
            role: row.try_get("role")?,
            outcome: row.try_get("outcome")?,
            output_delta: row.try_get("output_delta")?,
            error_detail: row.try_get("error_detail")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_attempt(self) -> Result<StepAttempt, RepositoryError> {
        let role: AttemptRole = self.role.parse().map_err(RepositoryError::Query)?;
        let outcome: AttemptOutcome = self.outcome.parse().map_err(RepositoryError::Query)?;

        Ok(StepAttempt {
            run_id: parse_uuid(&self.run_id)?,
            step_name: self.step_name,
            step_index: self.step_index as usize,
            attempt_number: self.attempt_number as u32,
            role,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            outcome,
            output_delta: from_json::<OutputDelta>(&self.output_delta, "output_delta")?,
            error_detail: self
                .error_detail
                .as_deref()
                .map(|s| from_json::<ErrorDetail>(s, "error_detail"))
                .transpose()?,
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let output_delta = to_json(&attempt.output_delta, "output_delta")?;
        let error_detail = attempt
            .error_detail
            .as_ref()
            .map(|d| to_json(d, "error_detail"))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO step_attempts
               (run_id, step_name, step_index, attempt_number, role, outcome,
                output_delta, error_detail, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.run_id.to_string())
        .bind(&attempt.step_name)
        .bind(attempt.step_index as i64)
        .bind(attempt.attempt_number as i64)
        .bind(attempt.role.as_str())
        .bind(attempt.outcome.as_str())
        .bind(&output_delta)
        .bind(&error_detail)
        .bind(format_datetime(&attempt.started_at))
        .bind(attempt.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            insert_error(e, || {
                format!(
                    "attempt {} of step '{}' already recorded for run {}",
                    attempt.attempt_number, attempt.step_name, attempt.run_id
                )
            })
        })?;

        Ok(())
    }

    async fn list_attempts(&self, run_id: &Uuid) -> Result<Vec<StepAttempt>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_attempts WHERE run_id = ? ORDER BY step_index ASC, seq ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = AttemptRow::from_row(row).map_err(query_error)?;
            attempts.push(r.into_attempt()?);
        }
        Ok(attempts)
    }
}
