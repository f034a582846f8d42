//! Versioned, content-addressed playbook storage.
//!
//! Registration parses and validates the document before anything touches
//! the database, so a catalog row always holds a playbook the broker can
//! load. Versions are per-path and assigned monotonically; rows are
//! immutable once written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};

use super::{StorageError, StorageResult};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PlaybookRecord {
    pub catalog_id: i64,
    pub path: String,
    pub version: i64,
    pub content_yaml: String,
    pub content_hash: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a playbook under `path`, assigning the next version.
    ///
    /// Re-registering identical content under the same path is a no-op that
    /// returns the existing latest row.
    pub async fn register(&self, path: &str, content_yaml: &str) -> StorageResult<PlaybookRecord> {
        playbook::parse(content_yaml)
            .map_err(|e| StorageError::Invalid(format!("playbook rejected: {e}")))?;

        let content_hash = hash_content(content_yaml);

        if let Some(latest) = self.latest(path).await? {
            if latest.content_hash == content_hash {
                return Ok(latest);
            }
        }

        let record = sqlx::query_as::<_, PlaybookRecord>(
            r#"
            INSERT INTO catalog (path, version, content_yaml, content_hash)
            VALUES (
                $1,
                COALESCE((SELECT MAX(version) FROM catalog WHERE path = $1), 0) + 1,
                $2,
                $3
            )
            RETURNING catalog_id, path, version, content_yaml, content_hash, registered_at
            "#,
        )
        .bind(path)
        .bind(content_yaml)
        .bind(&content_hash)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            path = %record.path,
            version = record.version,
            content_hash = %record.content_hash,
            "playbook registered"
        );
        Ok(record)
    }

    pub async fn fetch(&self, catalog_id: i64) -> StorageResult<PlaybookRecord> {
        sqlx::query_as::<_, PlaybookRecord>(
            r#"
            SELECT catalog_id, path, version, content_yaml, content_hash, registered_at
            FROM catalog
            WHERE catalog_id = $1
            "#,
        )
        .bind(catalog_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("playbook {catalog_id}")))
    }

    pub async fn fetch_version(&self, path: &str, version: i64) -> StorageResult<PlaybookRecord> {
        sqlx::query_as::<_, PlaybookRecord>(
            r#"
            SELECT catalog_id, path, version, content_yaml, content_hash, registered_at
            FROM catalog
            WHERE path = $1 AND version = $2
            "#,
        )
        .bind(path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("playbook {path}@{version}")))
    }

    pub async fn latest(&self, path: &str) -> StorageResult<Option<PlaybookRecord>> {
        Ok(sqlx::query_as::<_, PlaybookRecord>(
            r#"
            SELECT catalog_id, path, version, content_yaml, content_hash, registered_at
            FROM catalog
            WHERE path = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Latest version per path.
    pub async fn list(&self) -> StorageResult<Vec<PlaybookRecord>> {
        Ok(sqlx::query_as::<_, PlaybookRecord>(
            r#"
            SELECT DISTINCT ON (path)
                   catalog_id, path, version, content_yaml, content_hash, registered_at
            FROM catalog
            ORDER BY path, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
