//! Durable job queue: FIFO with leases, scoped by execution.
//!
//! Leasing uses `FOR UPDATE SKIP LOCKED` so any number of workers can lease
//! concurrently without contention. Terminal transitions are compare-and-set
//! on `(status, worker_id)`; a worker whose lease was lost gets a conflict,
//! never a silent overwrite.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub job_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    /// Opaque bytes; consumers see exactly what the broker wrote.
    pub action_spec: Vec<u8>,
    pub input_context: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub lease_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub parent_job_id: Option<i64>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = "job_id, execution_id, node_id, action_spec, input_context, status, \
                           attempts, lease_until, worker_id, parent_job_id, cancel_requested, \
                           last_error, created_at, updated_at";

/// Jobs freed by a reaper sweep, grouped by what happened to them.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Returned to pending for another lease.
    pub requeued: Vec<(i64, i64)>,
    /// Failed at the attempt ceiling (poison jobs).
    pub poisoned: Vec<(i64, i64)>,
    /// Cancel-requested jobs whose worker never acked.
    pub cancelled: Vec<(i64, i64)>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.poisoned.is_empty() && self.cancelled.is_empty()
    }

    /// Executions touched by this sweep, deduplicated.
    pub fn execution_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .requeued
            .iter()
            .chain(&self.poisoned)
            .chain(&self.cancelled)
            .map(|(_, execution_id)| *execution_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
    max_attempts: i32,
}

impl JobQueue {
    pub fn new(pool: PgPool, max_attempts: i32) -> Self {
        Self { pool, max_attempts }
    }

    /// Insert a pending job.
    ///
    /// Idempotent per `(execution_id, node_id)`: if a pending or leased job
    /// already exists for that node, returns the existing id and writes
    /// nothing.
    pub async fn enqueue(
        &self,
        execution_id: i64,
        node_id: &str,
        action_spec: &[u8],
        input_context: &Value,
        parent_job_id: Option<i64>,
    ) -> StorageResult<i64> {
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO queue_jobs (execution_id, node_id, action_spec, input_context, parent_job_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id, node_id) WHERE status IN ('pending', 'leased')
            DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(action_spec)
        .bind(input_context)
        .bind(parent_job_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job_id) = inserted {
            tracing::debug!(execution_id, node_id, job_id, "job enqueued");
            return Ok(job_id);
        }

        // Idempotency hit: surface the live job's id.
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT job_id FROM queue_jobs
            WHERE execution_id = $1 AND node_id = $2 AND status IN ('pending', 'leased')
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StorageError::Conflict(format!(
                "job for execution {execution_id} node {node_id} vanished during enqueue"
            ))
        })
    }

    /// Lease up to `max_jobs` pending jobs for `worker_id`.
    ///
    /// FIFO by `job_id`; each lease increments `attempts`, including leases
    /// that follow a reap.
    pub async fn lease(
        &self,
        worker_id: &str,
        max_jobs: i64,
        lease_ms: i64,
    ) -> StorageResult<Vec<JobRecord>> {
        let jobs = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT job_id
                FROM queue_jobs
                WHERE status = 'pending' AND attempts < $4
                ORDER BY job_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET status = 'leased',
                worker_id = $2,
                lease_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE job_id IN (SELECT job_id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(max_jobs)
        .bind(worker_id)
        .bind(lease_ms.to_string())
        .bind(self.max_attempts)
        .fetch_all(&self.pool)
        .await?;

        if !jobs.is_empty() {
            tracing::debug!(worker_id, count = jobs.len(), "jobs leased");
        }
        Ok(jobs)
    }

    /// `leased → done`, guarded by worker id. Returns the execution id so
    /// the caller can trigger a broker re-evaluation.
    pub async fn complete(&self, job_id: i64, worker_id: &str) -> StorageResult<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE queue_jobs
            SET status = 'done', updated_at = NOW()
            WHERE job_id = $1 AND status = 'leased' AND worker_id = $2
            RETURNING execution_id
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(execution_id) => Ok(execution_id),
            None => Err(self.state_mismatch(job_id, worker_id, "complete").await?),
        }
    }

    /// `leased → failed`, guarded by worker id.
    pub async fn fail(&self, job_id: i64, worker_id: &str, error: &str) -> StorageResult<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE queue_jobs
            SET status = 'failed', last_error = $3, updated_at = NOW()
            WHERE job_id = $1 AND status = 'leased' AND worker_id = $2
            RETURNING execution_id
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(execution_id) => Ok(execution_id),
            None => Err(self.state_mismatch(job_id, worker_id, "fail").await?),
        }
    }

    /// Push `lease_until` forward. Conflicts when cancellation has been
    /// requested for the job, which is how in-flight workers learn of it.
    pub async fn extend(&self, job_id: i64, worker_id: &str, lease_ms: i64) -> StorageResult<i64> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE queue_jobs
            SET lease_until = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE job_id = $1 AND status = 'leased' AND worker_id = $2
              AND NOT cancel_requested
            RETURNING execution_id
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_ms.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(execution_id) => Ok(execution_id),
            None => Err(self.state_mismatch(job_id, worker_id, "extend").await?),
        }
    }

    /// Cancel an execution's jobs.
    ///
    /// Pending jobs go straight to `cancelled`. With `cascade`, leased jobs
    /// are flagged so the worker's next extend conflicts and it can stop the
    /// tool, emit its cancelled error and ack via `fail`.
    pub async fn cancel_execution(&self, execution_id: i64, cascade: bool) -> StorageResult<u64> {
        let mut affected = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'cancelled', updated_at = NOW()
            WHERE execution_id = $1 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if cascade {
            affected += sqlx::query(
                r#"
                UPDATE queue_jobs
                SET cancel_requested = TRUE, updated_at = NOW()
                WHERE execution_id = $1 AND status = 'leased'
                "#,
            )
            .bind(execution_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }

        tracing::info!(execution_id, affected, "execution jobs cancelled");
        Ok(affected)
    }

    /// Background sweep over expired leases.
    ///
    /// Expired leases normally go back to `pending` with attempts intact.
    /// Cancel-requested jobs go to `cancelled`, and jobs at the attempt
    /// ceiling are failed so a poison job cannot loop forever.
    pub async fn reap_expired(&self) -> StorageResult<ReapReport> {
        let mut report = ReapReport::default();

        report.cancelled = sqlx::query_as::<_, (i64, i64)>(
            r#"
            UPDATE queue_jobs
            SET status = 'cancelled',
                last_error = 'lease expired after cancellation request',
                updated_at = NOW()
            WHERE status = 'leased' AND lease_until < NOW() AND cancel_requested
            RETURNING job_id, execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        report.poisoned = sqlx::query_as::<_, (i64, i64)>(
            r#"
            UPDATE queue_jobs
            SET status = 'failed',
                last_error = 'lease expired at attempt ceiling (' || attempts || ')',
                updated_at = NOW()
            WHERE status = 'leased' AND lease_until < NOW() AND attempts >= $1
            RETURNING job_id, execution_id
            "#,
        )
        .bind(self.max_attempts)
        .fetch_all(&self.pool)
        .await?;

        report.requeued = sqlx::query_as::<_, (i64, i64)>(
            r#"
            UPDATE queue_jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_until = NULL,
                updated_at = NOW()
            WHERE status = 'leased' AND lease_until < NOW()
            RETURNING job_id, execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !report.is_empty() {
            tracing::info!(
                requeued = report.requeued.len(),
                poisoned = report.poisoned.len(),
                cancelled = report.cancelled.len(),
                "expired leases reaped"
            );
        }
        Ok(report)
    }

    /// Physically purge done jobs older than the grace period.
    pub async fn purge_done(&self, grace_secs: i64) -> StorageResult<u64> {
        let purged = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE status = 'done' AND updated_at < NOW() - ($1 || ' seconds')::INTERVAL
            "#,
        )
        .bind(grace_secs.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(purged)
    }

    pub async fn find(&self, job_id: i64) -> StorageResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("job {job_id}")))
    }

    /// All jobs for an execution, oldest first. The broker reads this to
    /// decide whether work is still outstanding.
    pub async fn for_execution(&self, execution_id: i64) -> StorageResult<Vec<JobRecord>> {
        Ok(sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE execution_id = $1 ORDER BY job_id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn state_mismatch(
        &self,
        job_id: i64,
        worker_id: &str,
        operation: &str,
    ) -> StorageResult<StorageError> {
        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match job {
            None => StorageError::NotFound(format!("job {job_id}")),
            Some(job) if job.cancel_requested && job.status == JobStatus::Leased => {
                StorageError::Conflict(format!("job {job_id}: cancellation requested"))
            }
            Some(job) => StorageError::Conflict(format!(
                "job {job_id}: cannot {operation}, status is {:?} and lease holder is {}",
                job.status,
                job.worker_id.as_deref().unwrap_or("nobody"),
            )),
        })
    }
}
