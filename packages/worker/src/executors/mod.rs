//! Tool executors.
//!
//! One closed dispatch over the action enum; each kind lives in its own
//! module. Executors are stateless across invocations; the only thing they
//! share is the worker's connection pools, acquired once at startup and
//! reused for every job.

pub mod code;
pub mod http;
pub mod sql;
pub mod subplaybook;

use std::collections::HashMap;
use std::sync::Arc;

use playbook::ActionSpec;
use queue_client::QueueClient;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The tool ran and reported failure; retryable per policy.
    #[error("{0}")]
    Tool(String),

    /// Cancellation observed at a suspension point.
    #[error("cancelled")]
    Cancelled,
}

/// Shared executor resources, created once per worker process.
pub struct Executors {
    http: reqwest::Client,
    code_runtime: String,
    queue: QueueClient,
    /// Relational pools keyed by dsn, so per-job suspensions share
    /// connections instead of dialing per call.
    pg_pools: Arc<Mutex<HashMap<String, PgPool>>>,
}

impl Executors {
    pub fn new(queue: QueueClient, code_runtime: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            code_runtime,
            queue,
            pg_pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run a rendered action. Returns the raw result value; normalisation is
    /// the caller's job.
    pub async fn execute(
        &self,
        action: &ActionSpec,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        match action {
            ActionSpec::Http {
                method,
                url,
                headers,
                params,
                payload,
                timeout_ms,
            } => {
                http::execute(
                    &self.http,
                    method,
                    url,
                    headers,
                    params,
                    payload.as_ref(),
                    *timeout_ms,
                    cancel,
                )
                .await
            }
            ActionSpec::InlineCode { source, runtime } => {
                let runtime = runtime.as_deref().unwrap_or(&self.code_runtime);
                code::execute(runtime, source, input, cancel).await
            }
            ActionSpec::SqlLocalAnalytics {
                statement,
                database,
            } => sql::execute_local(statement, database.as_deref(), cancel).await,
            ActionSpec::SqlRelational {
                statement,
                dsn,
                credential: _,
            } => {
                // The renderer resolves credentials into the dsn before the
                // spec reaches an executor.
                let dsn = dsn.as_deref().ok_or_else(|| {
                    ExecError::Tool("sql_relational action has no dsn after rendering".into())
                })?;
                let pool = self.pg_pool(dsn).await?;
                sql::execute_relational(&pool, statement, cancel).await
            }
            ActionSpec::Subplaybook {
                path,
                version,
                workload,
            } => {
                subplaybook::execute(
                    &self.queue,
                    path,
                    *version,
                    workload.clone().unwrap_or(Value::Null),
                    cancel,
                )
                .await
            }
            ActionSpec::IteratorChild { inner, .. } => {
                // Bindings were folded into the context at render time.
                Box::pin(self.execute(inner, input, cancel)).await
            }
        }
    }

    /// Pool for a relational dsn, shared with save hooks.
    pub async fn relational_pool(&self, dsn: &str) -> Result<PgPool, ExecError> {
        self.pg_pool(dsn).await
    }

    async fn pg_pool(&self, dsn: &str) -> Result<PgPool, ExecError> {
        let mut pools = self.pg_pools.lock().await;
        if let Some(pool) = pools.get(dsn) {
            return Ok(pool.clone());
        }
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(|e| ExecError::Tool(format!("cannot connect to database: {e}")))?;
        pools.insert(dsn.to_string(), pool.clone());
        Ok(pool)
    }
}
