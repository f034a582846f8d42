//! Action specifications: the closed set of executable units a step can run.
//!
//! Every step that does work carries exactly one `ActionSpec`. The enum is
//! deliberately closed; the worker dispatches on it from a single match, so a
//! new action kind means a new variant plus one executor, nothing else.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One executable unit inside a step.
///
/// Fields holding templates (urls, statements, source code) are rendered by
/// the worker just before execution; until then they travel as opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    /// An HTTP request.
    Http {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        headers: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        params: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Embedded code run by an external interpreter.
    ///
    /// The rendered input context arrives as JSON on stdin; whatever the
    /// process prints to stdout is the result (parsed as JSON when possible).
    InlineCode {
        source: String,
        /// Interpreter argv override; the worker default is used when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runtime: Option<String>,
    },

    /// SQL against the worker-local analytical store.
    SqlLocalAnalytics {
        statement: String,
        /// Database file path; in-memory when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
    },

    /// SQL against a relational server.
    SqlRelational {
        statement: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dsn: Option<String>,
        /// Name of a stored credential holding the dsn.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },

    /// Run another playbook as a child execution and wait for it.
    Subplaybook {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workload: Option<Value>,
    },

    /// One item of an iterator fan-out. Never written by playbook authors;
    /// the broker wraps the iterator's task in this when enqueuing children.
    IteratorChild {
        inner: Box<ActionSpec>,
        element_name: String,
        element: Value,
        index: usize,
    },
}

impl ActionSpec {
    /// Wire name of this action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionSpec::Http { .. } => "http",
            ActionSpec::InlineCode { .. } => "inline_code",
            ActionSpec::SqlLocalAnalytics { .. } => "sql_local_analytics",
            ActionSpec::SqlRelational { .. } => "sql_relational",
            ActionSpec::Subplaybook { .. } => "subplaybook",
            ActionSpec::IteratorChild { .. } => "iterator_child",
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Bounded re-attempt policy applied around a single action execution.
///
/// `max_attempts` counts the first try; the default of 1 means no retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Expression over `{error, attempt, success, data}`; absent means
    /// "retry on any tool error".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_when: Option<String>,
    /// Expression over the same context; true stops retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_when: Option<String>,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_when: None,
            stop_when: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Persist a projection of a successful result before the job is acked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum SaveSpec {
    /// Write into the execution's transient variable store.
    Transient {
        name: String,
        /// Template projecting the value; defaults to the whole result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Insert a row into a relational table.
    Postgres {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dsn: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
}
