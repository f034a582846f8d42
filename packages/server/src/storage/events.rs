//! Append-only event log, the sole source of truth for progression.
//!
//! Appends are single INSERTs; the id comes from the table's sequence, so
//! concurrent appends for one execution are permitted and totally ordered by
//! the assigner. Nothing here (or anywhere else) mutates or deletes a row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use super::{StorageError, StorageResult};

/// The closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    ExecutionComplete,
    ExecutionFailed,
    StepStarted,
    StepSkip,
    StepCompleted,
    ActionStarted,
    ActionCompleted,
    ActionError,
    StepResult,
    LoopStart,
    LoopIteration,
    LoopEnd,
    StepTransition,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStart => "execution_start",
            EventType::ExecutionComplete => "execution_complete",
            EventType::ExecutionFailed => "execution_failed",
            EventType::StepStarted => "step_started",
            EventType::StepSkip => "step_skip",
            EventType::StepCompleted => "step_completed",
            EventType::ActionStarted => "action_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionError => "action_error",
            EventType::StepResult => "step_result",
            EventType::LoopStart => "loop_start",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopEnd => "loop_end",
            EventType::StepTransition => "step_transition",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "execution_start" => EventType::ExecutionStart,
            "execution_complete" => EventType::ExecutionComplete,
            "execution_failed" => EventType::ExecutionFailed,
            "step_started" => EventType::StepStarted,
            "step_skip" => EventType::StepSkip,
            "step_completed" => EventType::StepCompleted,
            "action_started" => EventType::ActionStarted,
            "action_completed" => EventType::ActionCompleted,
            "action_error" => EventType::ActionError,
            "step_result" => EventType::StepResult,
            "loop_start" => EventType::LoopStart,
            "loop_iteration" => EventType::LoopIteration,
            "loop_end" => EventType::LoopEnd,
            "step_transition" => EventType::StepTransition,
            _ => return None,
        })
    }

    pub fn is_terminal_for_execution(&self) -> bool {
        matches!(self, EventType::ExecutionComplete | EventType::ExecutionFailed)
    }
}

/// A stored event.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EventRecord {
    pub event_id: i64,
    pub execution_id: i64,
    pub parent_event_id: Option<i64>,
    pub event_type: EventType,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub status: Option<String>,
    pub input_context: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub loop_meta: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// An event to be appended; the log assigns the id.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub execution_id: i64,
    pub event_type: EventType,
    pub parent_event_id: Option<i64>,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub status: Option<String>,
    pub input_context: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub loop_meta: Option<Value>,
}

impl EventDraft {
    pub fn new(execution_id: i64, event_type: EventType) -> Self {
        Self {
            execution_id,
            event_type,
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

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn input_context(mut self, context: Value) -> Self {
        self.input_context = Some(context);
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

    pub fn loop_meta(mut self, meta: Value) -> Self {
        self.loop_meta = Some(meta);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    pool: PgPool,
}

impl EventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event; returns the assigned id once the write is durable.
    pub async fn append(&self, draft: EventDraft) -> StorageResult<i64> {
        let event_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO events (
                execution_id, parent_event_id, event_type, node_id, node_name,
                status, input_context, result, error, duration_ms, loop_meta
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING event_id
            "#,
        )
        .bind(draft.execution_id)
        .bind(draft.parent_event_id)
        .bind(draft.event_type)
        .bind(&draft.node_id)
        .bind(&draft.node_name)
        .bind(&draft.status)
        .bind(&draft.input_context)
        .bind(&draft.result)
        .bind(&draft.error)
        .bind(draft.duration_ms)
        .bind(&draft.loop_meta)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            execution_id = draft.execution_id,
            event_id,
            event_type = draft.event_type.as_str(),
            node_id = draft.node_id.as_deref().unwrap_or(""),
            "event appended"
        );
        Ok(event_id)
    }

    /// Append a batch in order; ids come back in the same order.
    pub async fn append_many(&self, drafts: Vec<EventDraft>) -> StorageResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            ids.push(self.append(draft).await?);
        }
        Ok(ids)
    }

    /// Ordered read of an execution's events.
    pub async fn read(
        &self,
        execution_id: i64,
        since_id: Option<i64>,
        type_filter: Option<&[EventType]>,
    ) -> StorageResult<Vec<EventRecord>> {
        let events = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT event_id, execution_id, parent_event_id, event_type, node_id,
                   node_name, status, input_context, result, error, duration_ms,
                   loop_meta, created_at
            FROM events
            WHERE execution_id = $1
              AND event_id > $2
              AND ($3::event_type[] IS NULL OR event_type = ANY($3))
            ORDER BY event_id
            "#,
        )
        .bind(execution_id)
        .bind(since_id.unwrap_or(0))
        .bind(type_filter.map(<[EventType]>::to_vec))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// First event of an execution; `execution_start` for well-formed logs.
    pub async fn first(&self, execution_id: i64) -> StorageResult<EventRecord> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT event_id, execution_id, parent_event_id, event_type, node_id,
                   node_name, status, input_context, result, error, duration_ms,
                   loop_meta, created_at
            FROM events
            WHERE execution_id = $1
            ORDER BY event_id
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("events for execution {execution_id}")))
    }
}
