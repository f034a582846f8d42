//! Execution lifecycle endpoints: start, status, cancel.

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use queue_client::types::{
    CancelRequest, ExecutionStatusResponse, StartExecutionRequest, StartExecutionResponse,
};

use crate::server::app::AppState;
use crate::server::ApiError;
use crate::storage::events::{EventDraft, EventType};

pub async fn start_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<StartExecutionRequest>,
) -> Result<Json<StartExecutionResponse>, ApiError> {
    let kernel = &state.kernel;
    let record = match request.version {
        Some(version) => kernel.catalog.fetch_version(&request.path, version).await?,
        None => kernel
            .catalog
            .latest(&request.path)
            .await?
            .ok_or_else(|| ApiError::bad_request(format!("no playbook at {}", request.path)))?,
    };

    let document = playbook::parse(&record.content_yaml)
        .map_err(|e| ApiError::unprocessable(format!("stored playbook is invalid: {e}")))?;
    let workload = document.merged_workload(&request.workload);

    let execution = kernel.executions.create(record.catalog_id, &workload).await?;
    kernel
        .events
        .append(
            EventDraft::new(execution.execution_id, EventType::ExecutionStart)
                .input_context(workload)
                .result(json!({
                    "catalog_id": record.catalog_id,
                    "path": record.path,
                    "version": record.version,
                })),
        )
        .await?;

    tracing::info!(
        execution_id = execution.execution_id,
        path = %record.path,
        version = record.version,
        "execution started"
    );
    state.broker.trigger(execution.execution_id);
    Ok(Json(StartExecutionResponse {
        execution_id: execution.execution_id,
    }))
}

pub async fn status_handler(
    Extension(state): Extension<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<ExecutionStatusResponse>, ApiError> {
    let kernel = &state.kernel;
    let execution = kernel.executions.find(execution_id).await?;
    let events = kernel.events.read(execution_id, None, None).await?;

    let failure = events
        .iter()
        .find(|event| event.event_type == EventType::ExecutionFailed);
    let result: Option<Value> = events
        .iter()
        .rev()
        .find(|event| {
            matches!(
                event.event_type,
                EventType::StepResult | EventType::LoopEnd
            ) && event.result.is_some()
        })
        .and_then(|event| event.result.clone());

    Ok(Json(ExecutionStatusResponse {
        execution_id,
        status: execution.status.as_str().to_string(),
        started_at: execution.started_at,
        completed_at: execution.completed_at,
        result,
        error: failure.and_then(|event| event.error.clone()),
        root_cause_event_id: failure.and_then(|event| event.parent_event_id),
    }))
}

pub async fn cancel_handler(
    Extension(state): Extension<AppState>,
    Path(execution_id): Path<i64>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, ApiError> {
    let kernel = &state.kernel;
    // 404 before any side effect.
    kernel.executions.find(execution_id).await?;

    kernel
        .executions
        .request_cancel(execution_id, request.reason.as_deref())
        .await?;
    kernel
        .queue
        .cancel_execution(execution_id, request.cascade)
        .await?;

    tracing::info!(
        execution_id,
        reason = request.reason.as_deref().unwrap_or(""),
        cascade = request.cascade,
        "execution cancellation requested"
    );
    state.broker.trigger(execution_id);
    Ok(Json(json!({})))
}
