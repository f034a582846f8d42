//! Deterministic context rendering for workers.

use axum::extract::Extension;
use axum::Json;

use queue_client::types::{RenderRequest, RenderResponse};

use crate::server::app::AppState;
use crate::server::ApiError;

pub async fn render_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, ApiError> {
    let rendered = state
        .render
        .render_for_node(request.execution_id, &request.node_id, &request.raw_spec)
        .await?;
    Ok(Json(RenderResponse {
        rendered_spec: rendered.rendered_spec,
        input_context: rendered.input_context,
    }))
}
