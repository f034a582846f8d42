//! Catalog endpoints.

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Serialize;

use queue_client::types::{RegisterPlaybookRequest, RegisterPlaybookResponse};

use crate::server::app::AppState;
use crate::server::ApiError;

#[derive(Serialize)]
pub struct PlaybookSummary {
    pub catalog_id: i64,
    pub path: String,
    pub version: i64,
    pub content_hash: String,
}

pub async fn register_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RegisterPlaybookRequest>,
) -> Result<Json<RegisterPlaybookResponse>, ApiError> {
    let record = state
        .kernel
        .catalog
        .register(&request.path, &request.content_yaml)
        .await?;
    Ok(Json(RegisterPlaybookResponse {
        catalog_id: record.catalog_id,
        path: record.path,
        version: record.version,
        content_hash: record.content_hash,
    }))
}

pub async fn list_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<PlaybookSummary>>, ApiError> {
    let records = state.kernel.catalog.list().await?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| PlaybookSummary {
                catalog_id: record.catalog_id,
                path: record.path,
                version: record.version,
                content_hash: record.content_hash,
            })
            .collect(),
    ))
}

pub async fn fetch_handler(
    Extension(state): Extension<AppState>,
    Path(catalog_id): Path<i64>,
) -> Result<Json<crate::storage::catalog::PlaybookRecord>, ApiError> {
    let record = state.kernel.catalog.fetch(catalog_id).await?;
    Ok(Json(record))
}
