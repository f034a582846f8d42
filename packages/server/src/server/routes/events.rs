//! Event append endpoint.

use axum::extract::Extension;
use axum::Json;

use queue_client::types::AppendEventsRequest;

use crate::server::app::AppState;
use crate::server::ApiError;
use crate::storage::events::{EventDraft, EventType};

pub async fn append_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<AppendEventsRequest>,
) -> Result<Json<Vec<i64>>, ApiError> {
    let mut drafts = Vec::with_capacity(request.events.len());
    for event in request.events {
        let event_type = EventType::parse(&event.event_type).ok_or_else(|| {
            ApiError::unprocessable(format!("unknown event type `{}`", event.event_type))
        })?;
        drafts.push(EventDraft {
            execution_id: event.execution_id,
            event_type,
            parent_event_id: event.parent_event_id,
            node_id: event.node_id,
            node_name: event.node_name,
            status: event.status,
            input_context: event.input_context,
            result: event.result,
            error: event.error,
            duration_ms: event.duration_ms,
            loop_meta: event.loop_meta,
        });
    }
    let ids = state.kernel.events.append_many(drafts).await?;
    Ok(Json(ids))
}
