use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use uuid::Uuid;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the queue server.
    pub server_url: String,
    pub worker_id: String,
    /// Maximum jobs requested per lease call.
    pub lease_quota: i64,
    /// Concurrently executing jobs inside this process.
    pub parallelism: usize,
    pub lease_ms: i64,
    /// How long to wait when the queue is empty.
    pub poll_interval: Duration,
    /// Interpreter command for inline code, e.g. `python3`.
    pub code_runtime: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            server_url: env::var("QUEUE_SERVER_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            lease_quota: env::var("LEASE_QUOTA")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("LEASE_QUOTA must be a valid number")?,
            parallelism: env::var("PARALLELISM")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("PARALLELISM must be a valid number")?,
            lease_ms: env::var("LEASE_MS")
                .unwrap_or_else(|_| "60000".to_string())
                .parse()
                .context("LEASE_MS must be a valid number")?,
            poll_interval: Duration::from_millis(
                env::var("POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "2000".to_string())
                    .parse()
                    .context("POLL_INTERVAL_MS must be a valid number")?,
            ),
            code_runtime: env::var("CODE_RUNTIME").unwrap_or_else(|_| "python3".to_string()),
        })
    }

    /// Heartbeat cadence, kept well under half the lease.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.lease_ms as u64 / 3).max(250))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_quota: 10,
            parallelism: 8,
            lease_ms: 60_000,
            poll_interval: Duration::from_secs(2),
            code_runtime: "python3".to_string(),
        }
    }
}
