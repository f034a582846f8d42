//! Credential store: symmetric AEAD at rest.
//!
//! Payloads are encrypted with AES-256-GCM under a key supplied via
//! configuration. Decrypted data is handed out only when a caller asks for
//! it explicitly; nothing here ever writes plaintext into events or queue
//! payloads.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;

use super::{StorageError, StorageResult};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential key is not configured")]
    KeyMissing,

    #[error("credential key must be 32 bytes base64: {0}")]
    KeyInvalid(String),

    #[error("credential cipher failure")]
    Cipher,
}

/// Credential metadata plus, when requested, the decrypted payload.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub name: String,
    #[serde(rename = "type")]
    pub cred_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct CredentialRow {
    name: String,
    cred_type: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
    key: Option<Key<Aes256Gcm>>,
}

impl CredentialStore {
    /// `key_base64` is a base64-encoded 32-byte key; `None` disables the
    /// store (lookups fail, which is fine for deployments without secrets).
    pub fn new(pool: PgPool, key_base64: Option<&str>) -> Result<Self, CredentialError> {
        let key = match key_base64 {
            None => None,
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| CredentialError::KeyInvalid(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(CredentialError::KeyInvalid(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                Some(*Key::<Aes256Gcm>::from_slice(&bytes))
            }
        };
        Ok(Self { pool, key })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CredentialError> {
        let key = self.key.as_ref().ok_or(CredentialError::KeyMissing)?;
        Ok(Aes256Gcm::new(key))
    }

    pub async fn store(&self, name: &str, cred_type: &str, data: &Value) -> StorageResult<()> {
        let cipher = self.cipher().map_err(to_storage)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(data)
            .map_err(|e| StorageError::Invalid(format!("credential data is not json: {e}")))?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| to_storage(CredentialError::Cipher))?;

        sqlx::query(
            r#"
            INSERT INTO credentials (name, cred_type, nonce, ciphertext)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name)
            DO UPDATE SET cred_type = EXCLUDED.cred_type,
                          nonce = EXCLUDED.nonce,
                          ciphertext = EXCLUDED.ciphertext,
                          updated_at = NOW()
            "#,
        )
        .bind(name)
        .bind(cred_type)
        .bind(nonce.as_slice())
        .bind(&ciphertext)
        .execute(&self.pool)
        .await?;

        tracing::info!(name, cred_type, "credential stored");
        Ok(())
    }

    /// Fetch a credential; decrypts the payload only when `include_data`.
    pub async fn fetch(&self, name: &str, include_data: bool) -> StorageResult<CredentialView> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT name, cred_type, nonce, ciphertext, created_at
            FROM credentials
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("credential {name}")))?;

        let data = if include_data {
            let cipher = self.cipher().map_err(to_storage)?;
            let nonce = Nonce::from_slice(&row.nonce);
            let plaintext = cipher
                .decrypt(nonce, row.ciphertext.as_slice())
                .map_err(|_| to_storage(CredentialError::Cipher))?;
            Some(serde_json::from_slice(&plaintext).map_err(|e| {
                StorageError::Invalid(format!("stored credential is not json: {e}"))
            })?)
        } else {
            None
        };

        Ok(CredentialView {
            name: row.name,
            cred_type: row.cred_type,
            data,
            created_at: row.created_at,
        })
    }
}

fn to_storage(err: CredentialError) -> StorageError {
    StorageError::Invalid(err.to_string())
}
