//! Retry policy: the single place re-attempt decisions are made.
//!
//! A retry spec travels with the action; the worker consults it between
//! attempts. Backoff is exponential with full jitter: the computed delay is
//! the ceiling, the actual sleep is uniform in `[0, ceiling]`, which keeps
//! a fleet of workers from thundering back in lockstep.

use std::time::Duration;

use playbook::{Renderer, RetrySpec};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    spec: RetrySpec,
}

impl RetryPolicy {
    pub fn new(spec: Option<RetrySpec>) -> Self {
        Self {
            spec: spec.unwrap_or_default(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.spec.max_attempts.max(1)
    }

    /// Decide whether `attempt` (1-based, just failed) should be retried.
    ///
    /// `stop_when` wins over `retry_when`; a missing `retry_when` means any
    /// tool error is retryable. A template error in either guard stops
    /// retrying: a broken guard must not loop a failing action forever.
    pub fn should_retry(&self, attempt: u32, error: &str, data: Option<&Value>) -> bool {
        if attempt >= self.max_attempts() {
            return false;
        }
        let ctx = json!({
            "error": error,
            "attempt": attempt,
            "success": false,
            "data": data.cloned().unwrap_or(Value::Null),
        });
        let renderer = Renderer::sealed();

        if let Some(stop_when) = &self.spec.stop_when {
            match renderer.eval_bool(stop_when, &ctx) {
                Ok(true) => return false,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(%err, "stop_when guard failed to evaluate; not retrying");
                    return false;
                }
            }
        }

        match &self.spec.retry_when {
            None => true,
            Some(retry_when) => match renderer.eval_bool(retry_when, &ctx) {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::warn!(%err, "retry_when guard failed to evaluate; not retrying");
                    false
                }
            },
        }
    }

    /// Full-jitter backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = (self.spec.initial_delay_ms as f64
            * self.spec.backoff_multiplier.max(1.0).powi(exponent as i32))
        .min(self.spec.max_delay_ms as f64);
        let jittered = fastrand::f64() * ceiling;
        Duration::from_millis(jittered as u64)
    }

    /// The deterministic ceiling for a given attempt, exposed for tests.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = (self.spec.initial_delay_ms as f64
            * self.spec.backoff_multiplier.max(1.0).powi(exponent as i32))
        .min(self.spec.max_delay_ms as f64);
        Duration::from_millis(ceiling as u64)
    }
}
