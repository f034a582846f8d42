use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base64-encoded 32-byte AES-256-GCM key for credentials at rest.
    pub credential_key: Option<String>,
    /// How often the reaper sweeps expired leases, in milliseconds.
    pub reaper_interval_ms: u64,
    /// Hard ceiling on lease attempts before a job is failed as poison.
    pub max_job_attempts: i32,
    /// Grace period before done jobs are physically purged, in seconds.
    pub purge_grace_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            credential_key: env::var("CREDENTIAL_KEY").ok(),
            reaper_interval_ms: env::var("REAPER_INTERVAL_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("REAPER_INTERVAL_MS must be a valid number")?,
            max_job_attempts: env::var("MAX_JOB_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("MAX_JOB_ATTEMPTS must be a valid number")?,
            purge_grace_secs: env::var("PURGE_GRACE_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("PURGE_GRACE_SECS must be a valid number")?,
        })
    }
}
