//! SQL executors: local analytics (SQLite) and relational (Postgres).
//!
//! Queries return their rows as an array of JSON objects; statements return
//! `{"rows_affected": n}`. Numeric columns go through the worker's decimal
//! rule so arbitrary precision never leaks into event payloads.

use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::postgres::PgRow;
use sqlx::{Column, ConnectOptions, PgPool, Row, TypeInfo, ValueRef};
use tokio_util::sync::CancellationToken;

use crate::normalize::decimal_to_json;

use super::ExecError;

pub async fn execute_local(
    statement: &str,
    database: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Value, ExecError> {
    let options = match database {
        None => SqliteConnectOptions::new().in_memory(true),
        Some(path) => SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true),
    };
    let mut conn = options
        .connect()
        .await
        .map_err(|e| ExecError::Tool(format!("cannot open local database: {e}")))?;

    if wants_rows(statement) {
        let rows = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            rows = sqlx::query(statement).fetch_all(&mut conn) => {
                rows.map_err(|e| ExecError::Tool(format!("sql failed: {e}")))?
            }
        };
        Ok(Value::Array(rows.iter().map(sqlite_row_to_json).collect()))
    } else {
        let done = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            done = sqlx::query(statement).execute(&mut conn) => {
                done.map_err(|e| ExecError::Tool(format!("sql failed: {e}")))?
            }
        };
        Ok(json!({ "rows_affected": done.rows_affected() }))
    }
}

pub async fn execute_relational(
    pool: &PgPool,
    statement: &str,
    cancel: &CancellationToken,
) -> Result<Value, ExecError> {
    if wants_rows(statement) {
        let rows = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            rows = sqlx::query(statement).fetch_all(pool) => {
                rows.map_err(|e| ExecError::Tool(format!("sql failed: {e}")))?
            }
        };
        Ok(Value::Array(rows.iter().map(pg_row_to_json).collect()))
    } else {
        let done = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            done = sqlx::query(statement).execute(pool) => {
                done.map_err(|e| ExecError::Tool(format!("sql failed: {e}")))?
            }
        };
        Ok(json!({ "rows_affected": done.rows_affected() }))
    }
}

fn wants_rows(statement: &str) -> bool {
    let lowered = statement.trim().to_lowercase();
    lowered.starts_with("select")
        || lowered.starts_with("with")
        || lowered.starts_with("show")
        || lowered.starts_with("values")
        || lowered.starts_with("pragma")
        || lowered.contains("returning")
}

fn sqlite_row_to_json(row: &SqliteRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), sqlite_cell(row, index));
    }
    Value::Object(object)
}

fn sqlite_cell(row: &SqliteRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_uppercase();
    match type_name.as_str() {
        "INTEGER" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" | "NUMERIC" => row
            .try_get::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BOOLEAN" => row
            .try_get::<bool, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

fn pg_row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), pg_cell(row, index));
    }
    Value::Object(object)
}

fn pg_cell(row: &PgRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_uppercase();
    match type_name.as_str() {
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<i32, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<i64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<f32, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<f64, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(index)
            .map(decimal_to_json)
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<bool, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Value, _>(index)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|ts| Value::String(ts.to_string()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(index)
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_classification() {
        assert!(wants_rows("SELECT 1"));
        assert!(wants_rows("  with t as (select 1) select * from t"));
        assert!(wants_rows("INSERT INTO t VALUES (1) RETURNING id"));
        assert!(!wants_rows("INSERT INTO t VALUES (1)"));
        assert!(!wants_rows("CREATE TABLE t (id INTEGER)"));
    }

    #[tokio::test]
    async fn local_select_returns_rows() {
        let result = execute_local(
            "SELECT 1 AS one, 'x' AS label, 2.5 AS score",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            result,
            serde_json::json!([{ "one": 1, "label": "x", "score": 2.5 }])
        );
    }

    #[tokio::test]
    async fn local_ddl_reports_rows_affected() {
        let result = execute_local(
            "CREATE TABLE scratch (id INTEGER)",
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result["rows_affected"], 0);
    }

    #[tokio::test]
    async fn local_sql_error_is_a_tool_error() {
        let err = execute_local("SELEC nope", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Tool(_)));
    }
}
