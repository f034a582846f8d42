//! Postgres-backed stores: event log, catalog, job queue, transient
//! variables, credentials.
//!
//! Every store is a thin struct over the shared [`sqlx::PgPool`]; all
//! mutations go through single atomic statements so concurrent callers
//! coordinate via the database, never via process memory.

pub mod catalog;
pub mod credentials;
pub mod events;
pub mod executions;
pub mod queue;
pub mod vars;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store failed or is unreachable. Not retried here; callers
    /// see a 5xx and back off.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    /// Lease/complete mismatch or a job not in the expected status.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
