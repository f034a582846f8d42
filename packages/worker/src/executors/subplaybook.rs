//! Subplaybook executor: run another playbook as a child execution.
//!
//! The child runs through the same server and worker pool as everything
//! else; this executor just starts it and watches the status endpoint until
//! it settles. Cancelling the parent cancels the child.

use std::time::Duration;

use queue_client::types::{CancelRequest, StartExecutionRequest};
use queue_client::QueueClient;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::ExecError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn execute(
    queue: &QueueClient,
    path: &str,
    version: Option<i64>,
    workload: Value,
    cancel: &CancellationToken,
) -> Result<Value, ExecError> {
    let child_id = queue
        .start_execution(&StartExecutionRequest {
            path: path.to_string(),
            version,
            workload,
        })
        .await
        .map_err(|e| ExecError::Tool(format!("cannot start child execution: {e}")))?;

    tracing::debug!(child_id, path, "child execution started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = queue
                    .cancel_execution(
                        child_id,
                        &CancelRequest {
                            reason: Some("parent execution cancelled".into()),
                            cascade: true,
                        },
                    )
                    .await;
                return Err(ExecError::Cancelled);
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let status = match queue.execution_status(child_id).await {
            Ok(status) => status,
            Err(error) if error.is_unavailable() => {
                tracing::warn!(child_id, %error, "child status check failed; retrying");
                continue;
            }
            Err(error) => {
                return Err(ExecError::Tool(format!(
                    "child execution status lookup failed: {error}"
                )))
            }
        };

        if !status.is_terminal() {
            continue;
        }
        return match status.status.as_str() {
            "completed" => Ok(json!({
                "execution_id": child_id,
                "result": status.result,
            })),
            other => Err(ExecError::Tool(format!(
                "child execution {child_id} ended {other}: {}",
                status.error.unwrap_or_else(|| "no error recorded".into())
            ))),
        };
    }
}
