//! Reconstruction of execution progress from the event log.
//!
//! A pure fold: events in, per-step state out. The broker calls this at the
//! top of every evaluation instead of keeping any memory between calls, so
//! concurrent or repeated evaluations always reason from the same durable
//! facts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::storage::events::{EventRecord, EventType};

/// Folded view of one step's events.
#[derive(Debug, Default, Clone)]
pub struct StepProgress {
    pub started: bool,
    pub skipped: bool,
    pub completed: bool,
    pub action_completed: bool,
    /// Result recorded by a `step_result` event.
    pub result: Option<Value>,
    /// Result carried on `action_completed`, used when no `step_result`
    /// was emitted.
    pub action_result: Option<Value>,
    pub error: Option<String>,
    pub error_event_id: Option<i64>,
}

impl StepProgress {
    pub fn data(&self) -> Option<&Value> {
        self.result.as_ref().or(self.action_result.as_ref())
    }

    pub fn failed(&self) -> bool {
        self.error.is_some() && !self.action_completed && !self.completed
    }
}

/// Outcome of one iterator child.
#[derive(Debug, Clone)]
pub enum ChildOutcome {
    Success(Value),
    Error(String),
}

/// Folded view of an iterator step's fan-out.
#[derive(Debug, Default, Clone)]
pub struct IteratorProgress {
    /// Post-filter, post-sort items fixed by `loop_start`.
    pub items: Option<Vec<Value>>,
    /// Indexes launched so far (`loop_iteration` events).
    pub launched: BTreeSet<usize>,
    /// Terminal child outcomes by result index.
    pub outcomes: BTreeMap<usize, ChildOutcome>,
    pub ended: bool,
    /// Event id of the first failing child, for root-cause references.
    pub first_error_event_id: Option<i64>,
}

impl IteratorProgress {
    pub fn outstanding(&self) -> usize {
        self.launched
            .iter()
            .filter(|index| !self.outcomes.contains_key(index))
            .count()
    }

    pub fn first_error(&self) -> Option<(usize, &str)> {
        self.outcomes.iter().find_map(|(index, outcome)| match outcome {
            ChildOutcome::Error(error) => Some((*index, error.as_str())),
            ChildOutcome::Success(_) => None,
        })
    }
}

#[derive(Debug, Default)]
pub struct Progress {
    pub steps: HashMap<String, StepProgress>,
    pub iterators: HashMap<String, IteratorProgress>,
    /// Source nodes whose `step_transition` already went out.
    pub transitions_emitted: HashSet<String>,
    /// The terminal event, if the execution already finished.
    pub terminal: Option<EventType>,
    /// Event id of the first `action_error` in the log (root cause).
    pub first_action_error: Option<i64>,
}

impl Progress {
    pub fn fold(events: &[EventRecord]) -> Self {
        let mut progress = Progress::default();
        for event in events {
            progress.apply(event);
        }
        progress
    }

    fn apply(&mut self, event: &EventRecord) {
        let node = event.node_id.as_deref();
        match event.event_type {
            EventType::ExecutionComplete | EventType::ExecutionFailed => {
                self.terminal.get_or_insert(event.event_type);
            }
            EventType::ExecutionStart => {}
            EventType::ActionStarted => {}
            EventType::StepTransition => {
                if let Some(node) = node {
                    self.transitions_emitted.insert(node.to_string());
                }
            }
            EventType::StepStarted => {
                if let Some(node) = node {
                    self.step_mut(node).started = true;
                }
            }
            EventType::StepSkip => {
                if let Some(node) = node {
                    self.step_mut(node).skipped = true;
                }
            }
            EventType::StepCompleted => {
                if let Some(node) = node {
                    let step = self.step_mut(node);
                    step.completed = true;
                    if step.result.is_none() {
                        step.result = event.result.clone();
                    }
                }
            }
            EventType::StepResult => {
                if let Some(node) = node {
                    if parse_child_node(node).is_none() {
                        self.step_mut(node).result = event.result.clone();
                    }
                }
            }
            EventType::ActionCompleted => {
                if let Some(node) = node {
                    match parse_child_node(node) {
                        Some((parent, index)) => {
                            self.iterator_mut(parent).outcomes.insert(
                                index,
                                ChildOutcome::Success(
                                    event.result.clone().unwrap_or(Value::Null),
                                ),
                            );
                        }
                        None => {
                            let step = self.step_mut(node);
                            step.action_completed = true;
                            step.action_result = event.result.clone();
                        }
                    }
                }
            }
            EventType::ActionError => {
                self.first_action_error.get_or_insert(event.event_id);
                if let Some(node) = node {
                    let error = event
                        .error
                        .clone()
                        .unwrap_or_else(|| "action failed".to_string());
                    match parse_child_node(node) {
                        Some((parent, index)) => {
                            let iterator = self.iterator_mut(parent);
                            iterator
                                .outcomes
                                .entry(index)
                                .or_insert(ChildOutcome::Error(error));
                            iterator.first_error_event_id.get_or_insert(event.event_id);
                        }
                        None => {
                            let step = self.step_mut(node);
                            step.error = Some(error);
                            step.error_event_id = Some(event.event_id);
                        }
                    }
                }
            }
            EventType::LoopStart => {
                if let Some(node) = node {
                    let items = event
                        .loop_meta
                        .as_ref()
                        .and_then(|meta| meta.get("items"))
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    self.iterator_mut(node).items = Some(items);
                }
            }
            EventType::LoopIteration => {
                if let Some(node) = node {
                    let index = event
                        .loop_meta
                        .as_ref()
                        .and_then(|meta| meta.get("result_index"))
                        .and_then(Value::as_u64);
                    if let Some(index) = index {
                        self.iterator_mut(node).launched.insert(index as usize);
                    }
                }
            }
            EventType::LoopEnd => {
                if let Some(node) = node {
                    self.iterator_mut(node).ended = true;
                    let step = self.step_mut(node);
                    if step.result.is_none() {
                        step.result = event.result.clone();
                    }
                }
            }
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepProgress> {
        self.steps.get(name)
    }

    /// Record a completion the broker just appended, keeping this fold in
    /// sync with the log without a re-read.
    pub fn mark_completed(&mut self, name: &str) {
        self.step_mut(name).completed = true;
    }

    fn step_mut(&mut self, name: &str) -> &mut StepProgress {
        self.steps.entry(name.to_string()).or_default()
    }

    pub fn iterator(&self, name: &str) -> Option<&IteratorProgress> {
        self.iterators.get(name)
    }

    fn iterator_mut(&mut self, name: &str) -> &mut IteratorProgress {
        self.iterators.entry(name.to_string()).or_default()
    }

    /// The accumulated template context: workload plus `<step>.data` for
    /// every step with a recorded result, plus transient variables.
    pub fn accumulated_context(&self, execution_id: i64, workload: &Value, vars: &Value) -> Value {
        let mut ctx = serde_json::Map::new();
        ctx.insert("execution_id".into(), Value::from(execution_id));
        ctx.insert("workload".into(), workload.clone());
        ctx.insert("vars".into(), vars.clone());
        for (name, step) in &self.steps {
            let mut entry = serde_json::Map::new();
            if let Some(data) = step.data() {
                entry.insert("data".into(), data.clone());
            }
            if let Some(error) = &step.error {
                entry.insert("error".into(), Value::String(error.clone()));
            }
            if !entry.is_empty() {
                ctx.insert(name.clone(), Value::Object(entry));
            }
        }
        Value::Object(ctx)
    }
}

/// Node id for iterator child `index` of `step`.
pub fn child_node(step: &str, index: usize) -> String {
    format!("{step}[{index}]")
}

/// `"fetch[3]"` → `("fetch", 3)`.
pub fn parse_child_node(node: &str) -> Option<(&str, usize)> {
    let open = node.rfind('[')?;
    let inner = node.get(open + 1..node.len().checked_sub(1)?)?;
    if !node.ends_with(']') {
        return None;
    }
    let index = inner.parse().ok()?;
    Some((&node[..open], index))
}
