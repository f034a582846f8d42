//! HTTP client for the queue server.
//!
//! Used by workers for the whole server surface: leasing, acks, rendering,
//! event emission, transient variables and child executions. One client per
//! worker process; reqwest pools connections underneath.

pub mod types;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use types::*;

#[derive(Debug, Error)]
pub enum QueueApiError {
    /// Transport-level failure; the server may be unreachable.
    #[error("queue api transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 409: lease/complete mismatch or cancel-requested job. The caller must
    /// drop its result without re-emitting.
    #[error("queue state conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 5xx: the backing store is unavailable; callers back off.
    #[error("queue server unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("queue api error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl QueueApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueApiError::Conflict(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            QueueApiError::Unavailable { .. } | QueueApiError::Transport(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    base_url: String,
    http: reqwest::Client,
}

impl QueueClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<i64, QueueApiError> {
        let response: EnqueueResponse = self.post("/queue/enqueue", request).await?;
        Ok(response.job_id)
    }

    pub async fn lease(&self, request: &LeaseRequest) -> Result<Vec<LeasedJob>, QueueApiError> {
        self.post("/queue/lease", request).await
    }

    pub async fn complete(&self, job_id: i64, worker_id: &str) -> Result<(), QueueApiError> {
        let body = CompleteRequest {
            worker_id: worker_id.to_string(),
        };
        self.post_unit(&format!("/queue/{job_id}/complete"), &body)
            .await
    }

    pub async fn fail(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<(), QueueApiError> {
        let body = FailRequest {
            worker_id: worker_id.to_string(),
            error: error.to_string(),
        };
        self.post_unit(&format!("/queue/{job_id}/fail"), &body).await
    }

    pub async fn extend(
        &self,
        job_id: i64,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<(), QueueApiError> {
        let body = ExtendRequest {
            worker_id: worker_id.to_string(),
            lease_ms,
        };
        self.post_unit(&format!("/queue/{job_id}/extend"), &body)
            .await
    }

    // ------------------------------------------------------------------
    // Rendering and events
    // ------------------------------------------------------------------

    pub async fn render(&self, request: &RenderRequest) -> Result<RenderResponse, QueueApiError> {
        self.post("/context/render", request).await
    }

    pub async fn append_events(&self, events: Vec<NewEvent>) -> Result<Vec<i64>, QueueApiError> {
        self.post("/events", &AppendEventsRequest { events }).await
    }

    pub async fn append_event(&self, event: NewEvent) -> Result<i64, QueueApiError> {
        let ids = self.append_events(vec![event]).await?;
        ids.first().copied().ok_or(QueueApiError::Api {
            status: 200,
            message: "server returned no event id".into(),
        })
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    pub async fn start_execution(
        &self,
        request: &StartExecutionRequest,
    ) -> Result<i64, QueueApiError> {
        let response: StartExecutionResponse = self.post("/executions", request).await?;
        Ok(response.execution_id)
    }

    pub async fn execution_status(
        &self,
        execution_id: i64,
    ) -> Result<ExecutionStatusResponse, QueueApiError> {
        self.get(&format!("/executions/{execution_id}")).await
    }

    pub async fn cancel_execution(
        &self,
        execution_id: i64,
        request: &CancelRequest,
    ) -> Result<(), QueueApiError> {
        self.post_unit(&format!("/executions/{execution_id}/cancel"), request)
            .await
    }

    // ------------------------------------------------------------------
    // Transient variables
    // ------------------------------------------------------------------

    pub async fn get_var(
        &self,
        execution_id: i64,
        name: &str,
    ) -> Result<VarResponse, QueueApiError> {
        self.get(&format!("/vars/{execution_id}/{name}")).await
    }

    pub async fn set_vars(
        &self,
        execution_id: i64,
        request: &SetVarsRequest,
    ) -> Result<SetVarsResponse, QueueApiError> {
        self.post(&format!("/vars/{execution_id}"), request).await
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, QueueApiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<(), QueueApiError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::error_for(status, response).await)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, QueueApiError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, QueueApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(Self::error_for(status, response).await)
    }

    async fn error_for(status: StatusCode, response: reqwest::Response) -> QueueApiError {
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        match status {
            StatusCode::CONFLICT => QueueApiError::Conflict(message),
            StatusCode::NOT_FOUND => QueueApiError::NotFound(message),
            s if s.is_server_error() => QueueApiError::Unavailable {
                status: s.as_u16(),
                message,
            },
            s => QueueApiError::Api {
                status: s.as_u16(),
                message,
            },
        }
    }
}
