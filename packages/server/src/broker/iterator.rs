//! Iterator controller: expands loop steps into per-item child jobs and
//! aggregates their results.
//!
//! Holds no state between broker calls. The item list is fixed once, on the
//! `loop_start` event; launches are recorded as `loop_iteration` events;
//! aggregation counts terminal child events. Re-running a tick over the same
//! log is therefore a no-op until something new happens.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{json, Value};

use playbook::{IterationMode, LoopSpec, Renderer, ResolvedAction, Step};

use crate::broker::evaluator::BrokerError;
use crate::broker::progress::{child_node, ChildOutcome, IteratorProgress, Progress};
use crate::kernel::ServerKernel;
use crate::storage::events::{EventDraft, EventType};
use crate::storage::queue::{JobRecord, JobStatus};

/// What one tick of an iterator decided.
#[derive(Debug)]
pub enum IterOutcome {
    /// Children outstanding; nothing more to do until one finishes.
    InFlight,
    /// All children accounted for; carries the ordered aggregation.
    Completed(Value),
    /// A child failed and the loop halts.
    Failed {
        error: String,
        error_event_id: Option<i64>,
    },
}

/// Advance one iterator step as far as the log allows.
pub async fn tick(
    kernel: &ServerKernel,
    renderer: &Renderer,
    execution_id: i64,
    step: &Step,
    resolved: &ResolvedAction,
    ctx: &Value,
    progress: &Progress,
    jobs_by_node: &HashMap<&str, &JobRecord>,
) -> Result<IterOutcome, BrokerError> {
    let spec = step
        .loop_spec
        .as_ref()
        .expect("tick called on a non-iterator step");
    let name = step.step.as_str();

    let empty = IteratorProgress::default();
    let state = progress.iterator(name).unwrap_or(&empty);

    if state.ended {
        let result = progress
            .step(name)
            .and_then(|s| s.result.clone())
            .unwrap_or_else(|| Value::Array(vec![]));
        return Ok(IterOutcome::Completed(result));
    }

    let items = match &state.items {
        Some(items) => items.clone(),
        None => {
            let items = expand_items(renderer, spec, ctx)?;
            kernel
                .events
                .append(
                    EventDraft::new(execution_id, EventType::LoopStart)
                        .node(name)
                        .loop_meta(json!({
                            "count": items.len(),
                            "items": items,
                            "element": spec.element,
                            "mode": spec.mode,
                            "concurrency": spec.concurrency,
                        })),
                )
                .await?;
            items
        }
    };

    let total = items.len();
    if total == 0 {
        return finish(kernel, execution_id, name, Value::Array(vec![])).await;
    }

    // Fill in terminal outcomes the log does not know about: a child job that
    // died without an action_error (poison reap) still counts as failed.
    let mut outcomes = state.outcomes.clone();
    for index in &state.launched {
        if outcomes.contains_key(index) {
            continue;
        }
        let node = child_node(name, *index);
        if let Some(job) = jobs_by_node.get(node.as_str()) {
            if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
                let error = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "child job failed without a report".to_string());
                outcomes.insert(*index, ChildOutcome::Error(error));
            }
        }
    }

    // A recorded launch whose job vanished before insertion (crash between
    // the loop_iteration append and the enqueue) is re-enqueued; the event is
    // not repeated.
    for index in &state.launched {
        if outcomes.contains_key(index) {
            continue;
        }
        let node = child_node(name, *index);
        if !jobs_by_node.contains_key(node.as_str()) {
            enqueue_child(kernel, execution_id, name, spec, resolved, ctx, &items, *index)
                .await?;
        }
    }

    let first_error = outcomes.iter().find_map(|(index, outcome)| match outcome {
        ChildOutcome::Error(error) => Some((*index, error.clone())),
        ChildOutcome::Success(_) => None,
    });
    let outstanding = state
        .launched
        .iter()
        .filter(|index| !outcomes.contains_key(index))
        .count();

    if let Some((_, error)) = &first_error {
        if spec.halt_on_error {
            // Stop launching; the step fails once in-flight children settle.
            if outstanding > 0 {
                return Ok(IterOutcome::InFlight);
            }
            return Ok(IterOutcome::Failed {
                error: error.clone(),
                error_event_id: state.first_error_event_id,
            });
        }
    }

    // Launch whatever the mode allows.
    let capacity = match spec.mode {
        IterationMode::Sequential => {
            // One in flight; the next index only after its predecessor is
            // terminal.
            let next = state.launched.len();
            let predecessor_done = next == 0 || outcomes.contains_key(&(next - 1));
            usize::from(outstanding == 0 && predecessor_done && next < total)
        }
        IterationMode::Async => spec
            .concurrency
            .max(1)
            .saturating_sub(outstanding)
            .min(total - state.launched.len()),
    };

    let mut launched_now = 0;
    for index in state.launched.len()..state.launched.len() + capacity {
        launch_child(
            kernel,
            execution_id,
            name,
            spec,
            resolved,
            ctx,
            &items,
            index,
        )
        .await?;
        launched_now += 1;
    }

    if outstanding > 0 || launched_now > 0 {
        return Ok(IterOutcome::InFlight);
    }

    if state.launched.len() < total {
        // Not everything launched yet; the next evaluation continues.
        return Ok(IterOutcome::InFlight);
    }

    // Everything launched and terminal: aggregate in result-index order.
    let aggregated: Vec<Value> = (0..total)
        .map(|index| match outcomes.get(&index) {
            Some(ChildOutcome::Success(value)) => value.clone(),
            Some(ChildOutcome::Error(error)) => json!({ "error": error }),
            None => Value::Null,
        })
        .collect();
    finish(kernel, execution_id, name, Value::Array(aggregated)).await
}

async fn finish(
    kernel: &ServerKernel,
    execution_id: i64,
    name: &str,
    result: Value,
) -> Result<IterOutcome, BrokerError> {
    let count = result.as_array().map(Vec::len).unwrap_or(0);
    kernel
        .events
        .append(
            EventDraft::new(execution_id, EventType::LoopEnd)
                .node(name)
                .result(result.clone())
                .loop_meta(json!({ "count": count })),
        )
        .await?;
    kernel
        .events
        .append(
            EventDraft::new(execution_id, EventType::StepCompleted)
                .node(name)
                .result(result.clone()),
        )
        .await?;
    Ok(IterOutcome::Completed(result))
}

#[allow(clippy::too_many_arguments)]
async fn launch_child(
    kernel: &ServerKernel,
    execution_id: i64,
    name: &str,
    spec: &LoopSpec,
    resolved: &ResolvedAction,
    ctx: &Value,
    items: &[Value],
    index: usize,
) -> Result<(), BrokerError> {
    let element = items[index].clone();

    kernel
        .events
        .append(
            EventDraft::new(execution_id, EventType::LoopIteration)
                .node(name)
                .loop_meta(json!({
                    "result_index": index,
                    "element": element,
                })),
        )
        .await?;

    enqueue_child(kernel, execution_id, name, spec, resolved, ctx, items, index).await
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_child(
    kernel: &ServerKernel,
    execution_id: i64,
    name: &str,
    spec: &LoopSpec,
    resolved: &ResolvedAction,
    ctx: &Value,
    items: &[Value],
    index: usize,
) -> Result<(), BrokerError> {
    let element = items[index].clone();
    let node = child_node(name, index);

    let mut child_ctx = match ctx {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    child_ctx.insert(spec.element.clone(), element.clone());
    child_ctx.insert(
        "_loop".into(),
        json!({ "index": index, "element": element, "count": items.len() }),
    );
    child_ctx.insert(
        "this".into(),
        json!({ "index": index, "element": element }),
    );
    let child_ctx = Value::Object(child_ctx);

    let payload = ResolvedAction {
        action: playbook::ActionSpec::IteratorChild {
            inner: Box::new(resolved.action.clone()),
            element_name: spec.element.clone(),
            element,
            index,
        },
        retry: resolved.retry.clone(),
        save: resolved.save.clone(),
    };
    let bytes = serde_json::to_vec(&payload)
        .map_err(|e| BrokerError::Playbook(format!("child action does not serialize: {e}")))?;

    kernel
        .queue
        .enqueue(execution_id, &node, &bytes, &child_ctx, None)
        .await?;
    Ok(())
}

/// Render the collection and apply `where`, `order_by`, `limit` and `chunk`.
fn expand_items(
    renderer: &Renderer,
    spec: &LoopSpec,
    ctx: &Value,
) -> Result<Vec<Value>, BrokerError> {
    let collection = renderer
        .eval_expr(&spec.collection, ctx)
        .map_err(|e| BrokerError::Template(e.to_string()))?;
    let mut items: Vec<Value> = match collection {
        Value::Array(items) => items,
        Value::Null => vec![],
        other => {
            return Err(BrokerError::Template(format!(
                "iterator collection is not a list: {other}"
            )))
        }
    };

    if let Some(filter) = &spec.filter {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let item_ctx = bind_element(ctx, &spec.element, &item);
            let keep = renderer
                .eval_bool(filter, &item_ctx)
                .map_err(|e| BrokerError::Template(e.to_string()))?;
            if keep {
                kept.push(item);
            }
        }
        items = kept;
    }

    if let Some(order_by) = &spec.order_by {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let item_ctx = bind_element(ctx, &spec.element, &item);
            let key = renderer
                .eval_expr(order_by, &item_ctx)
                .map_err(|e| BrokerError::Template(e.to_string()))?;
            keyed.push((key, item));
        }
        keyed.sort_by(|(a, _), (b, _)| cmp_json(a, b));
        items = keyed.into_iter().map(|(_, item)| item).collect();
    }

    if let Some(limit) = spec.limit {
        items.truncate(limit);
    }

    if let Some(chunk) = spec.chunk {
        if chunk > 0 {
            items = items
                .chunks(chunk)
                .map(|slice| Value::Array(slice.to_vec()))
                .collect();
        }
    }

    Ok(items)
}

fn bind_element(ctx: &Value, element_name: &str, item: &Value) -> Value {
    let mut map = match ctx {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert(element_name.to_string(), item.clone());
    Value::Object(map)
}

/// Total order over JSON values for `order_by`: null < bool < number <
/// string < array < object, numerics by magnitude, the rest lexically.
fn cmp_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ordering = cmp_json(xi, yi);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
