//! The worker: lease, render, execute, report.
//!
//! ```text
//! Worker
//!     │
//!     ├─► POST /queue/lease             (up to lease_quota, parallelism-bounded)
//!     ├─► POST /events action_started   (one per attempt)
//!     ├─► POST /context/render          (once per job)
//!     ├─► dispatch to tool executor     (retry loop per policy)
//!     ├─► POST /events action_completed + step_result   | action_error
//!     └─► POST /queue/{id}/complete     | /queue/{id}/fail
//! ```
//!
//! A heartbeat task per job extends the lease at an interval well under half
//! the lease. A conflicting extend means the lease was lost or cancellation
//! was requested; either way the job's token is cancelled and every
//! suspension point after that bails out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use playbook::ResolvedAction;
use queue_client::types::{LeaseRequest, LeasedJob, NewEvent, RenderRequest};
use queue_client::{QueueApiError, QueueClient};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::executors::{ExecError, Executors};
use crate::normalize::normalize_result;
use crate::retry::RetryPolicy;
use crate::save;

pub struct Worker {
    client: QueueClient,
    executors: Executors,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let client = QueueClient::new(&config.server_url);
        let executors = Executors::new(client.clone(), config.code_runtime.clone());
        Arc::new(Self {
            client,
            executors,
            config,
        })
    }

    /// Poll loop. Runs until `shutdown` fires, then drains in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            lease_quota = self.config.lease_quota,
            parallelism = self.config.parallelism,
            "worker starting"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let available = semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let max_jobs = self.config.lease_quota.min(available as i64);
            let jobs = match self
                .client
                .lease(&LeaseRequest {
                    worker_id: self.config.worker_id.clone(),
                    max_jobs,
                    lease_ms: self.config.lease_ms,
                })
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "lease failed; backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "jobs leased");
            for job in jobs {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let worker = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.process_job(job, shutdown).await;
                    drop(permit);
                });
            }
        }

        // Drain: wait for permits to come home, bounded.
        info!(worker_id = %self.config.worker_id, "worker draining");
        let _ = tokio::time::timeout(
            Duration::from_secs(30),
            semaphore.acquire_many(self.config.parallelism as u32),
        )
        .await;
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn process_job(&self, job: LeasedJob, shutdown: CancellationToken) {
        let job_id = job.job_id;
        debug!(
            job_id,
            execution_id = job.execution_id,
            node_id = %job.node_id,
            attempt = job.attempt,
            "processing job"
        );

        // Heartbeat runs until the job settles; it owns cancellation
        // detection because a conflicting extend is how the server talks
        // back to an in-flight worker.
        let cancel = shutdown.child_token();
        let settled = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            job_id,
            self.config.worker_id.clone(),
            self.config.lease_ms,
            self.config.heartbeat_interval(),
            settled.clone(),
            cancel.clone(),
        ));

        self.run_job(&job, &cancel, &shutdown).await;

        settled.cancel();
        let _ = heartbeat.await;
    }

    /// Cancellation comes in two flavours: process shutdown abandons the
    /// lease (the reaper requeues the job for another worker), a server-side
    /// cancel or lost lease reports `action_error` and acks failure.
    async fn run_job(
        &self,
        job: &LeasedJob,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) {
        let payload: ResolvedAction = match serde_json::from_value(job.action.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                self.finish_error(job, None, &format!("action does not parse: {e}"), "error")
                    .await;
                return;
            }
        };
        let policy = RetryPolicy::new(payload.retry.clone());
        let max_attempts = policy.max_attempts();
        let mut rendered: Option<(ResolvedAction, Value)> = None;
        let mut last_started: Option<i64> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                if shutdown.is_cancelled() {
                    debug!(job_id = job.job_id, "shutdown; abandoning lease");
                } else {
                    self.finish_cancelled(job, last_started).await;
                }
                return;
            }

            let started_at = Instant::now();
            match self
                .client
                .append_event(
                    NewEvent::new(job.execution_id, "action_started")
                        .node(&job.node_id)
                        .with_status("running"),
                )
                .await
            {
                Ok(event_id) => last_started = Some(event_id),
                Err(e) => {
                    // Can't record facts: leave the lease to expire rather
                    // than run unobserved.
                    warn!(job_id = job.job_id, error = %e, "event emission failed; abandoning lease");
                    return;
                }
            }

            if rendered.is_none() {
                match self
                    .client
                    .render(&RenderRequest {
                        execution_id: job.execution_id,
                        node_id: job.node_id.clone(),
                        raw_spec: job.action.clone(),
                    })
                    .await
                {
                    Ok(response) => {
                        match serde_json::from_value::<ResolvedAction>(response.rendered_spec) {
                            Ok(spec) => rendered = Some((spec, response.input_context)),
                            Err(e) => {
                                self.finish_error(
                                    job,
                                    last_started,
                                    &format!("rendered action does not parse: {e}"),
                                    "error",
                                )
                                .await;
                                return;
                            }
                        }
                    }
                    Err(e) if e.is_unavailable() => {
                        warn!(job_id = job.job_id, error = %e, "render unavailable; abandoning lease");
                        return;
                    }
                    Err(e) => {
                        // Template errors are not retryable.
                        self.finish_error(job, last_started, &e.to_string(), "error")
                            .await;
                        return;
                    }
                }
            }
            let (spec, input_context) = rendered.as_ref().expect("rendered above");

            match self.executors.execute(&spec.action, input_context, cancel).await {
                Ok(raw) => {
                    let duration_ms = started_at.elapsed().as_millis() as i64;
                    let data = match normalize_result(raw) {
                        Ok(data) => data,
                        Err(e) => {
                            self.finish_error(job, last_started, &e.to_string(), "error")
                                .await;
                            return;
                        }
                    };

                    if let Some(save_spec) = &spec.save {
                        if let Err(e) = save::apply(
                            &self.executors,
                            &self.client,
                            save_spec,
                            job.execution_id,
                            &job.node_id,
                            &data,
                            input_context,
                        )
                        .await
                        {
                            self.finish_error(job, last_started, &e, "error").await;
                            return;
                        }
                    }

                    let mut completed = NewEvent::new(job.execution_id, "action_completed")
                        .node(&job.node_id)
                        .result(data.clone())
                        .duration_ms(duration_ms)
                        .with_status("success");
                    if let Some(parent) = last_started {
                        completed = completed.parent(parent);
                    }
                    let events = vec![
                        completed,
                        NewEvent::new(job.execution_id, "step_result")
                            .node(&job.node_id)
                            .result(data),
                    ];
                    if let Err(e) = self.client.append_events(events).await {
                        warn!(job_id = job.job_id, error = %e, "result emission failed");
                        self.ack_fail(job, &format!("result emission failed: {e}")).await;
                        return;
                    }

                    match self.client.complete(job.job_id, &self.config.worker_id).await {
                        Ok(()) => debug!(job_id = job.job_id, "job done"),
                        Err(e) if e.is_conflict() => {
                            // Lease lost; the result stands in the log, the
                            // queue outcome belongs to someone else now.
                            warn!(job_id = job.job_id, error = %e, "complete conflicted; result dropped");
                        }
                        Err(e) => error!(job_id = job.job_id, error = %e, "complete failed"),
                    }
                    return;
                }
                Err(ExecError::Cancelled) => {
                    if shutdown.is_cancelled() {
                        debug!(job_id = job.job_id, "shutdown; abandoning lease");
                    } else {
                        self.finish_cancelled(job, last_started).await;
                    }
                    return;
                }
                Err(ExecError::Tool(tool_error)) => {
                    if attempt < max_attempts
                        && !cancel.is_cancelled()
                        && policy.should_retry(attempt, &tool_error, None)
                    {
                        let delay = policy.backoff(attempt);
                        debug!(
                            job_id = job.job_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %tool_error,
                            "retrying after backoff"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                if !shutdown.is_cancelled() {
                                    self.finish_cancelled(job, last_started).await;
                                }
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    self.finish_error(job, last_started, &tool_error, "error").await;
                    return;
                }
            }
        }
    }

    /// Emit `action_error` and ack failure.
    async fn finish_error(
        &self,
        job: &LeasedJob,
        parent: Option<i64>,
        error: &str,
        status: &str,
    ) {
        let mut event = NewEvent::new(job.execution_id, "action_error")
            .node(&job.node_id)
            .error(error)
            .with_status(status);
        if let Some(parent) = parent {
            event = event.parent(parent);
        }
        if let Err(e) = self.client.append_event(event).await {
            warn!(job_id = job.job_id, error = %e, "action_error emission failed");
        }
        self.ack_fail(job, error).await;
    }

    async fn finish_cancelled(&self, job: &LeasedJob, parent: Option<i64>) {
        info!(job_id = job.job_id, node_id = %job.node_id, "job cancelled");
        if parent.is_some() {
            self.finish_error(job, parent, "cancelled", "cancelled").await;
        } else {
            // No action_started was emitted; keep the log well-formed and
            // only ack the queue.
            self.ack_fail(job, "cancelled").await;
        }
    }

    async fn ack_fail(&self, job: &LeasedJob, error: &str) {
        match self
            .client
            .fail(job.job_id, &self.config.worker_id, error)
            .await
        {
            Ok(()) => {}
            Err(QueueApiError::Conflict(message)) => {
                debug!(job_id = job.job_id, message, "fail ack conflicted; dropped");
            }
            Err(e) => warn!(job_id = job.job_id, error = %e, "fail ack failed"),
        }
    }
}

async fn heartbeat_loop(
    client: QueueClient,
    job_id: i64,
    worker_id: String,
    lease_ms: i64,
    interval: Duration,
    settled: CancellationToken,
    job_cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate tick

    loop {
        tokio::select! {
            _ = settled.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match client.extend(job_id, &worker_id, lease_ms).await {
            Ok(()) => {}
            Err(QueueApiError::Conflict(message)) => {
                info!(job_id, message, "lease conflict; signalling cancellation");
                job_cancel.cancel();
                break;
            }
            Err(e) => warn!(job_id, error = %e, "heartbeat failed"),
        }
    }
}
