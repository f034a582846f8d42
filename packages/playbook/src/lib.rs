//! Playbook document model and deterministic template rendering.
//!
//! A playbook is a YAML document with three sections:
//!
//! - `workload`: default input parameters, merged under the values submitted
//!   at execution start
//! - `workflow`: the step DAG, from `start` to `end`
//! - `workbook`: named reusable task definitions referenced from steps
//!
//! This crate owns parsing, structural validation ([`graph::StepGraph`]) and
//! the pure template renderer ([`render::Renderer`]). It performs no I/O and
//! holds no execution state; everything downstream (queueing, brokering,
//! running tools) lives in the server and worker crates.

pub mod action;
pub mod error;
pub mod graph;
pub mod model;
pub mod render;

pub use action::{ActionSpec, RetrySpec, SaveSpec};
pub use error::{PlaybookError, RenderError};
pub use graph::{ResolvedAction, StepGraph, StepKind};
pub use model::{IterationMode, LoopSpec, Playbook, Step, StepCall, Transition, WorkbookTask};
pub use render::{CredentialResolver, NoCredentials, Renderer};

/// Parse and structurally validate a playbook document.
pub fn parse(yaml: &str) -> Result<Playbook, PlaybookError> {
    let playbook: Playbook = serde_yaml::from_str(yaml)?;
    // Building the graph runs all structural checks; the graph itself is
    // rebuilt on demand by callers that need it.
    StepGraph::build(&playbook)?;
    Ok(playbook)
}
