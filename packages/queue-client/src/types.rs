//! Wire types for the queue server HTTP API.
//!
//! Shared between the server's route handlers and the worker's client so the
//! two sides cannot drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub execution_id: i64,
    pub node_id: String,
    pub action: Value,
    pub input_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    pub max_jobs: i64,
    pub lease_ms: i64,
}

/// One leased job, ready to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub action: Value,
    pub input_context: Value,
    pub attempt: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub worker_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub worker_id: String,
    pub lease_ms: i64,
}

// ============================================================================
// Rendering
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub execution_id: i64,
    pub node_id: String,
    pub raw_spec: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResponse {
    pub rendered_spec: Value,
    pub input_context: Value,
}

// ============================================================================
// Events
// ============================================================================

/// An event to append; the server assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub execution_id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_meta: Option<Value>,
}

impl NewEvent {
    pub fn new(execution_id: i64, event_type: impl Into<String>) -> Self {
        Self {
            execution_id,
            event_type: event_type.into(),
            parent_event_id: None,
            node_id: None,
            node_name: None,
            status: None,
            input_context: None,
            result: None,
            error: None,
            duration_ms: None,
            loop_meta: None,
        }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        self.node_name = Some(node_id.clone());
        self.node_id = Some(node_id);
        self
    }

    pub fn parent(mut self, event_id: i64) -> Self {
        self.parent_event_id = Some(event_id);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEventsRequest {
    pub events: Vec<NewEvent>,
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub path: String,
    /// Pin to a specific playbook version; latest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default)]
    pub workload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub execution_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "default_true")]
    pub cascade: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Result of the last step to complete before `end`, when finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Event id of the first root-cause `action_error`, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_event_id: Option<i64>,
}

impl ExecutionStatusResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "cancelled")
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPlaybookRequest {
    pub path: String,
    pub content_yaml: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPlaybookResponse {
    pub catalog_id: i64,
    pub path: String,
    pub version: i64,
    pub content_hash: String,
}

// ============================================================================
// Transient variables
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarResponse {
    pub name: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVarsRequest {
    pub variables: serde_json::Map<String, Value>,
    #[serde(default = "default_var_type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,
}

fn default_var_type() -> String {
    "user_defined".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVarsResponse {
    pub variables_set: usize,
}

/// Error body returned by the server for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
}
