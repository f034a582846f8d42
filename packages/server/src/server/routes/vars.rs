//! Transient variable endpoints.

use axum::extract::{Extension, Path};
use axum::Json;

use queue_client::types::{SetVarsRequest, SetVarsResponse, VarResponse};

use crate::server::app::AppState;
use crate::server::ApiError;
use crate::storage::vars::VarType;

pub async fn get_handler(
    Extension(state): Extension<AppState>,
    Path((execution_id, name)): Path<(i64, String)>,
) -> Result<Json<VarResponse>, ApiError> {
    let record = state.kernel.vars.get(execution_id, &name).await?;
    Ok(Json(VarResponse {
        name: record.var_name,
        value: record.value,
        var_type: record.var_type.as_str().to_string(),
        source_step: record.source_step,
        access_count: record.access_count,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }))
}

pub async fn set_handler(
    Extension(state): Extension<AppState>,
    Path(execution_id): Path<i64>,
    Json(request): Json<SetVarsRequest>,
) -> Result<Json<SetVarsResponse>, ApiError> {
    let var_type = VarType::parse(&request.var_type)
        .ok_or_else(|| ApiError::unprocessable(format!("unknown var type `{}`", request.var_type)))?;

    // Writes go to the execution's scratchpad only; a missing execution is a
    // client error, not an implicit create.
    state.kernel.executions.find(execution_id).await?;

    let mut variables_set = 0;
    for (name, value) in &request.variables {
        state
            .kernel
            .vars
            .set(
                execution_id,
                name,
                value,
                var_type,
                request.source_step.as_deref(),
            )
            .await?;
        variables_set += 1;
    }
    Ok(Json(SetVarsResponse { variables_set }))
}
