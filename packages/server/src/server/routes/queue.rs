//! Queue endpoints: enqueue, lease, complete, fail, extend.
//!
//! `complete` and `fail` trigger an asynchronous broker re-evaluation for
//! the job's execution; that trigger is what keeps executions moving.

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use queue_client::types::{
    CompleteRequest, EnqueueRequest, EnqueueResponse, ExtendRequest, FailRequest, LeaseRequest,
    LeasedJob,
};

use crate::server::app::AppState;
use crate::server::ApiError;

pub async fn enqueue_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let bytes = serde_json::to_vec(&request.action)
        .map_err(|e| ApiError::bad_request(format!("action does not serialize: {e}")))?;
    let job_id = state
        .kernel
        .queue
        .enqueue(
            request.execution_id,
            &request.node_id,
            &bytes,
            &request.input_context,
            request.parent_job_id,
        )
        .await?;
    Ok(Json(EnqueueResponse { job_id }))
}

pub async fn lease_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<LeaseRequest>,
) -> Result<Json<Vec<LeasedJob>>, ApiError> {
    if request.max_jobs < 1 {
        return Err(ApiError::bad_request("max_jobs must be at least 1"));
    }
    if request.lease_ms < 1 {
        return Err(ApiError::bad_request("lease_ms must be positive"));
    }
    let jobs = state
        .kernel
        .queue
        .lease(&request.worker_id, request.max_jobs, request.lease_ms)
        .await?;

    let mut leased = Vec::with_capacity(jobs.len());
    for job in jobs {
        let action: Value = serde_json::from_slice(&job.action_spec).map_err(|e| {
            ApiError::unprocessable(format!("job {} action is not json: {e}", job.job_id))
        })?;
        leased.push(LeasedJob {
            job_id: job.job_id,
            execution_id: job.execution_id,
            node_id: job.node_id,
            action,
            input_context: job.input_context,
            attempt: job.attempts,
        });
    }
    Ok(Json(leased))
}

pub async fn complete_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<i64>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = state
        .kernel
        .queue
        .complete(job_id, &request.worker_id)
        .await?;
    state.broker.trigger(execution_id);
    Ok(Json(json!({})))
}

pub async fn fail_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<i64>,
    Json(request): Json<FailRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .kernel
        .queue
        .fail(job_id, &request.worker_id, &request.error)
        .await;

    // Even a conflicting ack can mean the execution changed shape (lease
    // reaped, cancellation): re-evaluate either way.
    match result {
        Ok(execution_id) => {
            state.broker.trigger(execution_id);
            Ok(Json(json!({})))
        }
        Err(error) => {
            if let Ok(job) = state.kernel.queue.find(job_id).await {
                state.broker.trigger(job.execution_id);
            }
            Err(error.into())
        }
    }
}

pub async fn extend_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<i64>,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.lease_ms < 1 {
        return Err(ApiError::bad_request("lease_ms must be positive"));
    }
    state
        .kernel
        .queue
        .extend(job_id, &request.worker_id, request.lease_ms)
        .await?;
    Ok(Json(json!({})))
}
