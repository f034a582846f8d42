//! Per-execution transient variable store.
//!
//! Scratch values that live outside the event log: step results projected by
//! `save`, user-defined values, system bookkeeping. Reads bump
//! `access_count`, writes bump `updated_at`. Visibility is strictly
//! execution-scoped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "var_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    StepResult,
    UserDefined,
    System,
}

impl VarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarType::StepResult => "step_result",
            VarType::UserDefined => "user_defined",
            VarType::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "step_result" => VarType::StepResult,
            "user_defined" => VarType::UserDefined,
            "system" => VarType::System,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VarRecord {
    pub execution_id: i64,
    pub var_name: String,
    pub value: Value,
    pub var_type: VarType,
    pub source_step: Option<String>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransientStore {
    pool: PgPool,
}

impl TransientStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read a variable, incrementing its access count.
    pub async fn get(&self, execution_id: i64, name: &str) -> StorageResult<VarRecord> {
        sqlx::query_as::<_, VarRecord>(
            r#"
            UPDATE transient_vars
            SET access_count = access_count + 1
            WHERE execution_id = $1 AND var_name = $2
            RETURNING execution_id, var_name, value, var_type, source_step,
                      access_count, created_at, updated_at
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("variable {name}")))
    }

    /// Upsert a variable.
    pub async fn set(
        &self,
        execution_id: i64,
        name: &str,
        value: &Value,
        var_type: VarType,
        source_step: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transient_vars (execution_id, var_name, value, var_type, source_step)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id, var_name)
            DO UPDATE SET value = EXCLUDED.value,
                          var_type = EXCLUDED.var_type,
                          source_step = EXCLUDED.source_step,
                          updated_at = NOW()
            "#,
        )
        .bind(execution_id)
        .bind(name)
        .bind(value)
        .bind(var_type)
        .bind(source_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All variables of an execution as a JSON object, without touching
    /// access counts. Used to assemble render contexts.
    pub async fn snapshot(&self, execution_id: i64) -> StorageResult<Value> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            r#"
            SELECT var_name, value FROM transient_vars
            WHERE execution_id = $1
            ORDER BY var_name
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map = serde_json::Map::with_capacity(rows.len());
        for (name, value) in rows {
            map.insert(name, value);
        }
        Ok(Value::Object(map))
    }

    pub async fn delete(&self, execution_id: i64, name: &str) -> StorageResult<bool> {
        let deleted = sqlx::query(
            "DELETE FROM transient_vars WHERE execution_id = $1 AND var_name = $2",
        )
        .bind(execution_id)
        .bind(name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_type_strings_round_trip() {
        for raw in ["step_result", "user_defined", "system"] {
            assert_eq!(VarType::parse(raw).unwrap().as_str(), raw);
        }
        assert!(VarType::parse("ephemeral").is_none());
    }
}
