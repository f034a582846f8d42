//! Execution records.
//!
//! A row is created at start and never deleted. `status` flips exactly once,
//! when the broker appends the terminal event; everything else about an
//! execution's progress is derived from the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRecord {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub workload: Value,
    pub status: ExecutionStatus,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const EXECUTION_COLUMNS: &str = "execution_id, catalog_id, workload, status, \
                                 cancel_requested_at, cancel_reason, started_at, completed_at";

#[derive(Debug, Clone)]
pub struct Executions {
    pool: PgPool,
}

impl Executions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, catalog_id: i64, workload: &Value) -> StorageResult<ExecutionRecord> {
        Ok(sqlx::query_as::<_, ExecutionRecord>(&format!(
            r#"
            INSERT INTO executions (catalog_id, workload)
            VALUES ($1, $2)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(catalog_id)
        .bind(workload)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn find(&self, execution_id: i64) -> StorageResult<ExecutionRecord> {
        sqlx::query_as::<_, ExecutionRecord>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("execution {execution_id}")))
    }

    /// Set the terminal status once; later calls are no-ops so concurrent
    /// evaluators cannot flip a terminal state.
    pub async fn finish(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
    ) -> StorageResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, completed_at = NOW()
            WHERE execution_id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(status)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn request_cancel(
        &self,
        execution_id: i64,
        reason: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET cancel_requested_at = COALESCE(cancel_requested_at, NOW()),
                cancel_reason = COALESCE(cancel_reason, $2)
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
