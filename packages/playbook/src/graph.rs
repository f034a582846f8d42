//! Step graph: validated view of a playbook's workflow.
//!
//! The broker never walks the raw `Vec<Step>`; it builds a `StepGraph` once
//! per evaluation and asks it for successors, predecessors and resolved
//! actions. Building the graph runs every structural check, so a playbook
//! that registered successfully cannot surprise the broker later.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::action::{ActionSpec, RetrySpec, SaveSpec};
use crate::error::PlaybookError;
use crate::model::{Playbook, Step, StepCall};

/// Name of the entry step every workflow must contain.
pub const START_STEP: &str = "start";
/// Name of the terminal step every workflow must contain.
pub const END_STEP: &str = "end";

/// What a step is, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Start,
    End,
    Action,
    Iterator,
}

/// A step's action with workbook-task indirection resolved.
///
/// Step-level `retry`/`save` override the task's own. This is also the job
/// payload the broker serialises into the queue, so workers see one
/// self-contained unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub action: ActionSpec,
    pub retry: Option<RetrySpec>,
    pub save: Option<SaveSpec>,
}

#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: IndexMap<String, Step>,
    tasks: HashMap<String, usize>,
    workbook: Vec<crate::model::WorkbookTask>,
    predecessors: HashMap<String, Vec<String>>,
}

impl StepGraph {
    pub fn build(playbook: &Playbook) -> Result<Self, PlaybookError> {
        let mut steps = IndexMap::with_capacity(playbook.workflow.len());
        for step in &playbook.workflow {
            if steps.insert(step.step.clone(), step.clone()).is_some() {
                return Err(PlaybookError::DuplicateStep(step.step.clone()));
            }
        }
        if !steps.contains_key(START_STEP) {
            return Err(PlaybookError::MissingTerminal(START_STEP));
        }
        if !steps.contains_key(END_STEP) {
            return Err(PlaybookError::MissingTerminal(END_STEP));
        }

        let mut tasks = HashMap::new();
        for (index, task) in playbook.workbook.iter().enumerate() {
            if tasks.insert(task.name.clone(), index).is_some() {
                return Err(PlaybookError::DuplicateTask(task.name.clone()));
            }
        }

        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for step in steps.values() {
            for transition in &step.next {
                let target = transition.target();
                if !steps.contains_key(target) {
                    return Err(PlaybookError::UnknownTransition {
                        step: step.step.clone(),
                        target: target.to_string(),
                    });
                }
                predecessors
                    .entry(target.to_string())
                    .or_default()
                    .push(step.step.clone());
            }
        }

        let graph = Self {
            steps,
            tasks,
            workbook: playbook.workbook.clone(),
            predecessors,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), PlaybookError> {
        for step in self.steps.values() {
            match self.kind(&step.step) {
                StepKind::Start => {
                    if step.call.is_some() || step.loop_spec.is_some() {
                        return Err(PlaybookError::InvalidStep(
                            step.step.clone(),
                            "start cannot carry an action".into(),
                        ));
                    }
                }
                StepKind::End => {
                    if !step.next.is_empty() {
                        return Err(PlaybookError::InvalidStep(
                            step.step.clone(),
                            "end cannot have transitions".into(),
                        ));
                    }
                }
                StepKind::Iterator => {
                    if step.call.is_none() {
                        return Err(PlaybookError::IteratorWithoutAction(step.step.clone()));
                    }
                }
                StepKind::Action => {}
            }
            if let Some(StepCall::Task { task }) = &step.call {
                if !self.tasks.contains_key(task) {
                    return Err(PlaybookError::UnknownTask {
                        step: step.step.clone(),
                        task: task.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Steps in workflow source order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn kind(&self, name: &str) -> StepKind {
        if name == START_STEP {
            StepKind::Start
        } else if name == END_STEP {
            StepKind::End
        } else if self
            .steps
            .get(name)
            .is_some_and(|step| step.loop_spec.is_some())
        {
            StepKind::Iterator
        } else {
            StepKind::Action
        }
    }

    /// Static predecessors of a step (sources of edges pointing at it).
    pub fn predecessors(&self, name: &str) -> &[String] {
        self.predecessors
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve a step's action, following a `task:` reference into the
    /// workbook if needed.
    pub fn resolve_action(&self, step: &Step) -> Option<ResolvedAction> {
        match step.call.as_ref()? {
            StepCall::Inline(action) => Some(ResolvedAction {
                action: action.clone(),
                retry: step.retry.clone(),
                save: step.save.clone(),
            }),
            StepCall::Task { task } => {
                let index = *self.tasks.get(task)?;
                let task = &self.workbook[index];
                Some(ResolvedAction {
                    action: task.call.clone(),
                    retry: step.retry.clone().or_else(|| task.retry.clone()),
                    save: step.save.clone().or_else(|| task.save.clone()),
                })
            }
        }
    }
}
