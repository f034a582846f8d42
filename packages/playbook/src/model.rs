//! Serde model for the playbook YAML document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionSpec, RetrySpec, SaveSpec};

/// A parsed playbook document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default workload; values submitted at execution start win.
    #[serde(default = "empty_object")]
    pub workload: Value,
    pub workflow: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workbook: Vec<WorkbookTask>,
}

impl Playbook {
    /// Merge the submitted workload over this playbook's defaults.
    ///
    /// Shallow merge: top-level keys from `submitted` replace defaults.
    pub fn merged_workload(&self, submitted: &Value) -> Value {
        let mut merged = match &self.workload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Value::Object(overrides) = submitted {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Object(merged)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A named reusable action definition referenced from steps via `task:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookTask {
    pub name: String,
    pub call: ActionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<SaveSpec>,
}

/// One node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Guard expression; false produces a `step_skip` and no job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<StepCall>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<SaveSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<Transition>,
}

/// Either an inline action or a reference to a workbook task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepCall {
    Task { task: String },
    Inline(ActionSpec),
}

/// An outgoing edge of a step.
///
/// `- report` is shorthand for `- step: report`. Routing semantics depend on
/// the whole list: if any entry carries `when`, entries are evaluated in
/// source order and the first true guard wins, with a guardless entry acting
/// as the else-branch. If no entry carries `when`, all entries fan out in
/// parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transition {
    Name(String),
    Guarded(GuardedTransition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardedTransition {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl Transition {
    pub fn target(&self) -> &str {
        match self {
            Transition::Name(name) => name,
            Transition::Guarded(guarded) => &guarded.step,
        }
    }

    pub fn when(&self) -> Option<&str> {
        match self {
            Transition::Name(_) => None,
            Transition::Guarded(guarded) => guarded.when.as_deref(),
        }
    }
}

/// Per-item fan-out configuration for an iterator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Expression yielding the collection to iterate.
    pub collection: String,
    /// Name the current element is bound to inside each child.
    #[serde(default = "default_element_name")]
    pub element: String,
    #[serde(default)]
    pub mode: IterationMode,
    /// Upper bound on concurrently outstanding children in async mode.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sort key expression over the element, applied before iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Filter expression over the element, applied before sorting.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Group consecutive items into slices of this size; each slice becomes
    /// one element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    /// Sequential mode only: stop launching children after a failed item.
    #[serde(default = "default_true")]
    pub halt_on_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    #[default]
    Sequential,
    Async,
}

fn default_element_name() -> String {
    "item".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}
