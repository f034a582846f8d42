//! Broker evaluation: derive the next enqueues or terminal events for one
//! execution from its event log and pinned playbook.
//!
//! `evaluate` is safe to call at any time, from anywhere, as often as you
//! like. All decisions are re-derived from the log and the queue; the only
//! cross-call coordination is a per-execution Postgres advisory lock that
//! serialises concurrent evaluators so reconciliation events (step
//! completions, terminals) are appended exactly once.
//!
//! Evaluations are triggered opportunistically: on execution start, on every
//! queue ack, on cancellation, and by the reaper after it frees leases.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use playbook::{PlaybookError, RenderError, Renderer, Step, StepGraph, StepKind};

use crate::broker::iterator::{self, IterOutcome};
use crate::broker::progress::Progress;
use crate::kernel::ServerKernel;
use crate::storage::events::{EventDraft, EventType};
use crate::storage::executions::{ExecutionRecord, ExecutionStatus};
use crate::storage::queue::{JobRecord, JobStatus};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A `when`, transition guard or collection template failed to render.
    /// Escalates the execution to `execution_failed`.
    #[error("template error: {0}")]
    Template(String),

    /// The pinned playbook no longer parses or is structurally broken.
    #[error("playbook error: {0}")]
    Playbook(String),

    /// Store trouble; logged and retried on the next trigger.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RenderError> for BrokerError {
    fn from(err: RenderError) -> Self {
        BrokerError::Template(err.to_string())
    }
}

impl From<PlaybookError> for BrokerError {
    fn from(err: PlaybookError) -> Self {
        BrokerError::Playbook(err.to_string())
    }
}

/// Where a step stands, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disp {
    /// Not reached yet.
    Untouched,
    /// Enqueued or leased; a terminal ack will trigger the next evaluation.
    Running,
    /// Terminal with a result.
    Done,
    /// Guard evaluated false; terminal for joins and routing.
    Skipped,
    /// Terminal with an error.
    Failed,
}

impl Disp {
    fn is_decided(self) -> bool {
        matches!(self, Disp::Done | Disp::Skipped | Disp::Failed)
    }
}

pub struct Broker {
    kernel: Arc<ServerKernel>,
}

impl Broker {
    pub fn new(kernel: Arc<ServerKernel>) -> Arc<Self> {
        Arc::new(Self { kernel })
    }

    /// Fire-and-forget evaluation, used by route handlers and background
    /// tasks. Failures are logged; the next trigger retries.
    pub fn trigger(self: &Arc<Self>, execution_id: i64) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = broker.evaluate(execution_id).await {
                tracing::warn!(execution_id, %error, "broker evaluation failed");
            }
        });
    }

    /// Evaluate one execution under its advisory lock.
    pub async fn evaluate(&self, execution_id: i64) -> Result<(), BrokerError> {
        let mut conn = self.kernel.pool.acquire().await.map_err(StorageError::from)?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(execution_id)
            .execute(conn.as_mut())
            .await
            .map_err(StorageError::from)?;

        let result = self.evaluate_guarded(execution_id).await;
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(BrokerError::Template(message)) | Err(BrokerError::Playbook(message)) => {
                self.fail_execution(execution_id, &message, None).await
            }
            Err(storage) => Err(storage),
        };

        let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(execution_id)
            .execute(conn.as_mut())
            .await;
        outcome
    }

    async fn evaluate_guarded(&self, execution_id: i64) -> Result<(), BrokerError> {
        let kernel = &self.kernel;
        let execution = match kernel.executions.find(execution_id).await {
            Ok(execution) => execution,
            Err(StorageError::NotFound(_)) => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        if execution.status.is_terminal() {
            return Ok(());
        }

        let events = kernel.events.read(execution_id, None, None).await?;
        let mut progress = Progress::fold(&events);

        if let Some(terminal) = progress.terminal {
            // Event exists but the status row lagged; reconcile and stop.
            let status = terminal_status(terminal, &execution);
            kernel.executions.finish(execution_id, status).await?;
            return Ok(());
        }

        let record = kernel.catalog.fetch(execution.catalog_id).await?;
        let document = playbook::parse(&record.content_yaml)?;
        let graph = StepGraph::build(&document)?;

        let jobs = kernel.queue.for_execution(execution_id).await?;
        let jobs_by_node: HashMap<&str, &JobRecord> = jobs
            .iter()
            .map(|job| (job.node_id.as_str(), job))
            .collect();
        let vars = kernel.vars.snapshot(execution_id).await?;
        let renderer = Renderer::sealed();

        // Reconcile: a worker acked success but the completion event is the
        // broker's to write.
        for step in graph.steps() {
            let name = step.step.as_str();
            let Some(state) = progress.step(name) else { continue };
            if state.completed || state.skipped {
                continue;
            }
            let done = match graph.kind(name) {
                StepKind::Action => state.action_completed,
                StepKind::Iterator => progress.iterator(name).is_some_and(|i| i.ended),
                _ => false,
            };
            if done {
                let draft = EventDraft::new(execution_id, EventType::StepCompleted).node(name);
                let draft = match state.data() {
                    Some(data) => draft.result(data.clone()),
                    None => draft,
                };
                kernel.events.append(draft).await?;
                progress.mark_completed(name);
            }
        }

        // Cancellation: wait for in-flight jobs to settle, then close out.
        if execution.cancel_requested_at.is_some() {
            let live = jobs.iter().any(|job| !job.status.is_terminal());
            if !live {
                let reason = execution
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string());
                self.finish_failed(
                    execution_id,
                    &format!("execution cancelled: {reason}"),
                    progress.first_action_error,
                    ExecutionStatus::Cancelled,
                )
                .await?;
            }
            return Ok(());
        }

        let mut ctx = progress.accumulated_context(execution_id, &execution.workload, &vars);
        let mut disp: HashMap<String, Disp> = graph
            .steps()
            .map(|step| {
                let name = step.step.clone();
                let d = initial_disposition(&graph, &progress, &jobs_by_node, &name);
                (name, d)
            })
            .collect();
        let mut failures: HashMap<String, (String, Option<i64>)> = HashMap::new();
        for step in graph.steps() {
            let name = step.step.as_str();
            if disp[name] != Disp::Failed {
                continue;
            }
            let (error, event_id) = failure_details(&progress, &jobs_by_node, name);
            bind_error(&mut ctx, name, &error);
            failures.insert(name.to_string(), (error, event_id));
        }

        // Iterators already in flight advance on every evaluation.
        for step in graph.steps() {
            let name = step.step.as_str();
            if graph.kind(name) != StepKind::Iterator || disp[name] != Disp::Running {
                continue;
            }
            let resolved = graph
                .resolve_action(step)
                .ok_or_else(|| BrokerError::Playbook(format!("iterator {name} has no action")))?;
            match iterator::tick(
                kernel, &renderer, execution_id, step, &resolved, &ctx, &progress, &jobs_by_node,
            )
            .await?
            {
                IterOutcome::InFlight => {}
                IterOutcome::Completed(result) => {
                    bind_result(&mut ctx, name, &result);
                    disp.insert(name.to_string(), Disp::Done);
                }
                IterOutcome::Failed { error, error_event_id } => {
                    bind_error(&mut ctx, name, &error);
                    failures.insert(name.to_string(), (error, error_event_id));
                    disp.insert(name.to_string(), Disp::Failed);
                }
            }
        }

        // Fixpoint: route decided steps, activate ready successors, repeat
        // while skips and instant completions keep deciding new steps.
        let mut processed: HashSet<String> = HashSet::new();
        let mut selected_successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut end_ready = false;

        for _round in 0..graph.steps().count() + 2 {
            let mut changed = false;

            // Phase 1: compute routing for every decided, unprocessed step.
            let decided: Vec<String> = graph
                .steps()
                .map(|s| s.step.clone())
                .filter(|name| disp[name].is_decided() && !processed.contains(name))
                .collect();
            for name in decided {
                let step = graph.step(&name).expect("step disappeared");
                let selected = match disp[&name] {
                    Disp::Done | Disp::Skipped => {
                        self.select_transitions(&renderer, step, &ctx)?
                    }
                    Disp::Failed => {
                        let (error, event_id) = failures
                            .get(&name)
                            .cloned()
                            .unwrap_or_else(|| ("action failed".to_string(), None));
                        match self.select_error_route(&renderer, step, &ctx)? {
                            Some(route) => route,
                            None => {
                                return self
                                    .finish_failed(
                                        execution_id,
                                        &error,
                                        event_id.or(progress.first_action_error),
                                        ExecutionStatus::Failed,
                                    )
                                    .await;
                            }
                        }
                    }
                    _ => unreachable!(),
                };
                if name == playbook::graph::START_STEP
                    && !progress.transitions_emitted.contains(&name)
                    && !selected.is_empty()
                {
                    kernel
                        .events
                        .append(
                            EventDraft::new(execution_id, EventType::StepTransition)
                                .node(&name)
                                .result(json!({ "to": selected })),
                        )
                        .await?;
                }
                selected_successors.insert(name.clone(), selected);
                processed.insert(name);
                changed = true;
            }

            // Phase 2: reachability under current decisions. Decided steps
            // contribute only their chosen edges; undecided steps might still
            // take any edge.
            let reachable = reachable_set(&graph, &disp, &selected_successors);

            // Phase 3: activate ready targets.
            let targets: Vec<String> = {
                let mut seen = HashSet::new();
                selected_successors
                    .values()
                    .flatten()
                    .filter(|t| seen.insert((*t).clone()))
                    .cloned()
                    .collect()
            };
            for target in targets {
                if disp[&target] != Disp::Untouched {
                    continue;
                }
                let blocked = graph.predecessors(&target).iter().any(|pred| {
                    reachable.contains(pred.as_str()) && !disp[pred].is_decided()
                });
                if blocked {
                    continue;
                }
                match self
                    .activate(
                        execution_id,
                        &graph,
                        &renderer,
                        &progress,
                        &jobs_by_node,
                        &mut ctx,
                        &target,
                    )
                    .await?
                {
                    Activation::Running => {
                        disp.insert(target, Disp::Running);
                        changed = true;
                    }
                    Activation::Skipped => {
                        disp.insert(target, Disp::Skipped);
                        changed = true;
                    }
                    Activation::Done => {
                        disp.insert(target, Disp::Done);
                        changed = true;
                    }
                    Activation::Failed { error, error_event_id } => {
                        bind_error(&mut ctx, &target, &error);
                        failures.insert(target.clone(), (error, error_event_id));
                        disp.insert(target, Disp::Failed);
                        changed = true;
                    }
                    Activation::End => {
                        end_ready = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        if end_ready {
            return self.finish_completed(execution_id).await;
        }

        // Nothing running and nothing left to decide: the workflow drained
        // without reaching `end` (every remaining path was skipped).
        let anything_running = disp.values().any(|d| *d == Disp::Running);
        if !anything_running {
            return self.finish_completed(execution_id).await;
        }
        Ok(())
    }

    /// Route selection for a finished step: first true guard wins, a bare
    /// entry is the else-branch, all-bare means parallel fan-out.
    fn select_transitions(
        &self,
        renderer: &Renderer,
        step: &Step,
        ctx: &Value,
    ) -> Result<Vec<String>, BrokerError> {
        let has_guards = step.next.iter().any(|t| t.when().is_some());
        if !has_guards {
            return Ok(step.next.iter().map(|t| t.target().to_string()).collect());
        }
        let mut else_branch: Option<&str> = None;
        for transition in &step.next {
            match transition.when() {
                Some(guard) => {
                    if renderer.eval_bool(guard, ctx)? {
                        return Ok(vec![transition.target().to_string()]);
                    }
                }
                None => {
                    else_branch.get_or_insert(transition.target());
                }
            }
        }
        Ok(else_branch.map(|t| vec![t.to_string()]).unwrap_or_default())
    }

    /// Error routing: only guarded transitions are considered; the failed
    /// step's `error` binding is already in the context.
    fn select_error_route(
        &self,
        renderer: &Renderer,
        step: &Step,
        ctx: &Value,
    ) -> Result<Option<Vec<String>>, BrokerError> {
        for transition in &step.next {
            if let Some(guard) = transition.when() {
                if renderer.eval_bool(guard, ctx)? {
                    return Ok(Some(vec![transition.target().to_string()]));
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate(
        &self,
        execution_id: i64,
        graph: &StepGraph,
        renderer: &Renderer,
        progress: &Progress,
        jobs_by_node: &HashMap<&str, &JobRecord>,
        ctx: &mut Value,
        name: &str,
    ) -> Result<Activation, BrokerError> {
        let kernel = &self.kernel;
        match graph.kind(name) {
            StepKind::Start => Ok(Activation::Done),
            StepKind::End => Ok(Activation::End),
            kind @ (StepKind::Action | StepKind::Iterator) => {
                let step = graph.step(name).expect("step disappeared");
                if let Some(guard) = &step.when {
                    if !renderer.eval_bool(guard, ctx)? {
                        kernel
                            .events
                            .append(EventDraft::new(execution_id, EventType::StepSkip).node(name))
                            .await?;
                        return Ok(Activation::Skipped);
                    }
                }

                kernel
                    .events
                    .append(
                        EventDraft::new(execution_id, EventType::StepStarted)
                            .node(name)
                            .input_context(ctx.clone()),
                    )
                    .await?;

                let Some(resolved) = graph.resolve_action(step) else {
                    // A routing-only step: nothing to run, complete in place.
                    kernel
                        .events
                        .append(
                            EventDraft::new(execution_id, EventType::StepCompleted).node(name),
                        )
                        .await?;
                    return Ok(Activation::Done);
                };

                if kind == StepKind::Iterator {
                    return match iterator::tick(
                        kernel, renderer, execution_id, step, &resolved, ctx, progress,
                        jobs_by_node,
                    )
                    .await?
                    {
                        IterOutcome::InFlight => Ok(Activation::Running),
                        IterOutcome::Completed(result) => {
                            bind_result(ctx, name, &result);
                            Ok(Activation::Done)
                        }
                        IterOutcome::Failed { error, error_event_id } => {
                            Ok(Activation::Failed { error, error_event_id })
                        }
                    };
                }

                let bytes = serde_json::to_vec(&resolved).map_err(|e| {
                    BrokerError::Playbook(format!("action does not serialize: {e}"))
                })?;
                kernel
                    .queue
                    .enqueue(execution_id, name, &bytes, ctx, None)
                    .await?;
                Ok(Activation::Running)
            }
        }
    }

    async fn finish_completed(&self, execution_id: i64) -> Result<(), BrokerError> {
        // Guard against a concurrent terminal (belt and braces; we hold the
        // advisory lock, but the event must stay unique across retries).
        let terminal = self
            .kernel
            .events
            .read(
                execution_id,
                None,
                Some(&[EventType::ExecutionComplete, EventType::ExecutionFailed]),
            )
            .await?;
        if terminal.is_empty() {
            self.kernel
                .events
                .append(EventDraft::new(execution_id, EventType::ExecutionComplete))
                .await?;
        }
        self.kernel
            .executions
            .finish(execution_id, ExecutionStatus::Completed)
            .await?;
        tracing::info!(execution_id, "execution complete");
        Ok(())
    }

    async fn finish_failed(
        &self,
        execution_id: i64,
        error: &str,
        root_cause: Option<i64>,
        status: ExecutionStatus,
    ) -> Result<(), BrokerError> {
        let terminal = self
            .kernel
            .events
            .read(
                execution_id,
                None,
                Some(&[EventType::ExecutionComplete, EventType::ExecutionFailed]),
            )
            .await?;
        if terminal.is_empty() {
            let mut draft =
                EventDraft::new(execution_id, EventType::ExecutionFailed).error(error);
            if let Some(root_cause) = root_cause {
                draft = draft.parent(root_cause);
            }
            self.kernel.events.append(draft).await?;
        }
        self.kernel.executions.finish(execution_id, status).await?;
        tracing::info!(execution_id, error, status = status.as_str(), "execution failed");
        Ok(())
    }

    async fn fail_execution(
        &self,
        execution_id: i64,
        error: &str,
        root_cause: Option<i64>,
    ) -> Result<(), BrokerError> {
        self.finish_failed(execution_id, error, root_cause, ExecutionStatus::Failed)
            .await
    }
}

enum Activation {
    Running,
    Skipped,
    Done,
    Failed {
        error: String,
        error_event_id: Option<i64>,
    },
    End,
}

fn initial_disposition(
    graph: &StepGraph,
    progress: &Progress,
    jobs_by_node: &HashMap<&str, &JobRecord>,
    name: &str,
) -> Disp {
    if graph.kind(name) == StepKind::Start {
        return Disp::Done;
    }
    let state = progress.step(name);
    if let Some(state) = state {
        if state.completed {
            return Disp::Done;
        }
        if state.skipped {
            return Disp::Skipped;
        }
        if state.failed() {
            return Disp::Failed;
        }
    }
    if let Some(job) = jobs_by_node.get(name) {
        match job.status {
            JobStatus::Failed => return Disp::Failed,
            JobStatus::Pending | JobStatus::Leased => return Disp::Running,
            // Done without events yet resolves on the next pass; cancelled
            // jobs are handled by the cancellation branch.
            JobStatus::Done | JobStatus::Cancelled => {}
        }
    }
    if state.is_some_and(|s| s.started) {
        return Disp::Running;
    }
    Disp::Untouched
}

fn failure_details(
    progress: &Progress,
    jobs_by_node: &HashMap<&str, &JobRecord>,
    name: &str,
) -> (String, Option<i64>) {
    if let Some(state) = progress.step(name) {
        if let Some(error) = &state.error {
            return (error.clone(), state.error_event_id);
        }
    }
    let error = jobs_by_node
        .get(name)
        .and_then(|job| job.last_error.clone())
        .unwrap_or_else(|| "job failed without a report".to_string());
    (error, None)
}

/// Steps that can still be reached from `start` given current decisions.
fn reachable_set<'g>(
    graph: &'g StepGraph,
    disp: &HashMap<String, Disp>,
    selected: &HashMap<String, Vec<String>>,
) -> HashSet<&'g str> {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    if let Some(start) = graph.step(playbook::graph::START_STEP) {
        reachable.insert(start.step.as_str());
        queue.push_back(start.step.as_str());
    }
    while let Some(name) = queue.pop_front() {
        let followed: Vec<&str> = match (disp.get(name), selected.get(name)) {
            (Some(d), Some(chosen)) if d.is_decided() => {
                chosen.iter().map(String::as_str).collect()
            }
            _ => graph
                .step(name)
                .map(|step| step.next.iter().map(|t| t.target()).collect())
                .unwrap_or_default(),
        };
        for target in followed {
            if let Some(step) = graph.step(target) {
                if reachable.insert(step.step.as_str()) {
                    queue.push_back(step.step.as_str());
                }
            }
        }
    }
    reachable
}

fn terminal_status(terminal: EventType, execution: &ExecutionRecord) -> ExecutionStatus {
    match terminal {
        EventType::ExecutionComplete => ExecutionStatus::Completed,
        _ if execution.cancel_requested_at.is_some() => ExecutionStatus::Cancelled,
        _ => ExecutionStatus::Failed,
    }
}

fn bind_result(ctx: &mut Value, name: &str, result: &Value) {
    if let Value::Object(map) = ctx {
        map.insert(name.to_string(), json!({ "data": result }));
    }
}

fn bind_error(ctx: &mut Value, name: &str, error: &str) {
    if let Value::Object(map) = ctx {
        let entry = map
            .entry(name.to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(entry) = entry {
            entry.insert("error".into(), Value::String(error.to_string()));
        }
    }
}
