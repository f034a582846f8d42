//! Save hooks: persist a projection of a successful result before the job
//! is acked.

use playbook::{Renderer, SaveSpec};
use queue_client::types::SetVarsRequest;
use queue_client::QueueClient;
use serde_json::{json, Value};

use crate::executors::Executors;

/// Apply a save descriptor. An error here fails the job; the result is not
/// acked as done until the projection is durable.
pub async fn apply(
    executors: &Executors,
    client: &QueueClient,
    save: &SaveSpec,
    execution_id: i64,
    node_id: &str,
    result: &Value,
    input_context: &Value,
) -> Result<(), String> {
    let projected = project(save, result, input_context)?;
    match save {
        SaveSpec::Transient { name, .. } => {
            let mut variables = serde_json::Map::new();
            variables.insert(name.clone(), projected);
            client
                .set_vars(
                    execution_id,
                    &SetVarsRequest {
                        variables,
                        var_type: "step_result".to_string(),
                        source_step: Some(node_id.to_string()),
                    },
                )
                .await
                .map_err(|e| format!("save to transient store failed: {e}"))?;
            Ok(())
        }
        SaveSpec::Postgres { table, dsn, .. } => {
            let table = validated_table(table)?;
            let dsn = dsn
                .as_deref()
                .ok_or_else(|| "postgres save has no dsn after rendering".to_string())?;
            let pool = executors
                .relational_pool(dsn)
                .await
                .map_err(|e| format!("save target unreachable: {e}"))?;
            let statement = format!(
                "INSERT INTO {table} (execution_id, node_id, result) VALUES ($1, $2, $3)"
            );
            sqlx::query(&statement)
                .bind(execution_id)
                .bind(node_id)
                .bind(&projected)
                .execute(&pool)
                .await
                .map_err(|e| format!("save insert failed: {e}"))?;
            Ok(())
        }
    }
}

fn project(save: &SaveSpec, result: &Value, input_context: &Value) -> Result<Value, String> {
    let template = match save {
        SaveSpec::Transient { value, .. } | SaveSpec::Postgres { value, .. } => value.as_deref(),
    };
    let Some(template) = template else {
        return Ok(result.clone());
    };

    let mut ctx = match input_context {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    ctx.insert("this".into(), json!({ "data": result }));

    Renderer::sealed()
        .render_value(&Value::String(template.to_string()), &Value::Object(ctx))
        .map_err(|e| format!("save projection failed: {e}"))
}

fn validated_table(table: &str) -> Result<&str, String> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && table.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid {
        Ok(table)
    } else {
        Err(format!("`{table}` is not a valid save table name"))
    }
}
