// ServerKernel - core infrastructure with all dependencies
//
// The kernel holds the connection pool and one handle per store. Everything
// downstream (broker, routes, background tasks) borrows from here; no
// module-level state exists anywhere in the server.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::Config;
use crate::storage::catalog::Catalog;
use crate::storage::credentials::CredentialStore;
use crate::storage::events::EventLog;
use crate::storage::executions::Executions;
use crate::storage::queue::JobQueue;
use crate::storage::vars::TransientStore;

pub struct ServerKernel {
    pub pool: PgPool,
    pub config: Config,
    pub events: EventLog,
    pub catalog: Catalog,
    pub queue: JobQueue,
    pub executions: Executions,
    pub vars: TransientStore,
    pub credentials: CredentialStore,
}

impl ServerKernel {
    pub fn new(pool: PgPool, config: Config) -> Result<Self> {
        let credentials = CredentialStore::new(pool.clone(), config.credential_key.as_deref())
            .context("invalid CREDENTIAL_KEY")?;
        Ok(Self {
            events: EventLog::new(pool.clone()),
            catalog: Catalog::new(pool.clone()),
            queue: JobQueue::new(pool.clone(), config.max_job_attempts),
            executions: Executions::new(pool.clone()),
            vars: TransientStore::new(pool.clone()),
            credentials,
            pool,
            config,
        })
    }
}
