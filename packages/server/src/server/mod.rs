//! HTTP server: axum application, routes, error mapping.

pub mod app;
pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::render::RenderServiceError;
use crate::storage::StorageError;

/// Route-level error with a RESTful status mapping.
///
/// Every non-2xx body is `{"error": "..."}` so clients have one shape to
/// parse.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::Conflict(_) => StatusCode::CONFLICT,
            StorageError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StorageError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<RenderServiceError> for ApiError {
    fn from(err: RenderServiceError) -> Self {
        match err {
            RenderServiceError::Storage(storage) => storage.into(),
            RenderServiceError::Template(message) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message: format!("template error: {message}"),
            },
            RenderServiceError::Credential { name, message } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message: format!("credential `{name}` unavailable: {message}"),
            },
        }
    }
}
