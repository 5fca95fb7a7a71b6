//! Bounded retries with exponential backoff

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::config::RetryConfig;
use crate::error::{AgentFailure, FailureKind};
use crate::task::AgentResult;

/// Decides whether a failure is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&AgentFailure) -> bool + Send + Sync>;

/// Per-call bookkeeping, dropped when the call resolves
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub total_delay: Duration,
    pub last_error: Option<AgentFailure>,
}

/// Process-wide retry counters
#[derive(Debug, Default)]
pub struct RetryMetrics {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    non_retryable: AtomicU64,
    /// Calls refused by an open circuit before reaching the target
    rejected: AtomicU64,
}

/// Read-only view of [`RetryMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub non_retryable: u64,
    #[serde(default)]
    pub rejected: u64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RetryStats {
        RetryStats {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            non_retryable: self.non_retryable.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Wraps a call with bounded retries
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: RetryPredicate,
    audit: Arc<AuditLogger>,
    metrics: Arc<RetryMetrics>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            predicate: Arc::new(|failure: &AgentFailure| failure.retryable),
            audit,
            metrics: Arc::new(RetryMetrics::new()),
        }
    }

    /// Share counters with a context
    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the default `failure.retryable` predicate
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&AgentFailure) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry number `retry` (0-based), without jitter
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let base = self.config.base_delay().as_secs_f64()
            * self.config.multiplier.powi(retry as i32);
        let capped = base.min(self.config.max_delay().as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Backoff with symmetric jitter applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if self.config.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out
    ///
    /// `call` receives the 1-based attempt number. One `attempt` audit event is
    /// recorded per invocation that reached the target. A `CircuitOpen`
    /// rejection ends the loop without consuming an attempt.
    pub async fn execute<F, Fut>(&self, workflow_id: &str, step: &str, mut call: F) -> AgentResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AgentResult>,
    {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        let mut state = RetryState::default();

        loop {
            let attempt = state.attempts + 1;
            let result = call(attempt).await;

            if matches!(&result, Err(failure) if failure.kind == FailureKind::CircuitOpen) {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(workflow_id, step, attempts = state.attempts, "Circuit open, giving up");
                return result.map_err(|failure| failure.with_attempts(state.attempts));
            }
            state.attempts = attempt;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            let failure = match result {
                Ok(value) => {
                    self.audit.emit(
                        workflow_id,
                        step,
                        AuditKind::Attempt,
                        json!({ "attempt": attempt, "outcome": "success" }),
                    );
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !(self.predicate)(&failure) {
                self.metrics.non_retryable.fetch_add(1, Ordering::Relaxed);
                self.audit.emit(
                    workflow_id,
                    step,
                    AuditKind::Attempt,
                    json!({
                        "attempt": attempt,
                        "outcome": "failure",
                        "kind": failure.kind,
                        "message": failure.message,
                        "retry": false,
                    }),
                );
                debug!(workflow_id, step, attempt, kind = %failure.kind, "Not retrying");
                return Err(failure.with_attempts(attempt));
            }

            if attempt >= self.config.max_attempts {
                self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                self.audit.emit(
                    workflow_id,
                    step,
                    AuditKind::Attempt,
                    json!({
                        "attempt": attempt,
                        "outcome": "failure",
                        "kind": failure.kind,
                        "message": failure.message,
                        "retry": false,
                        "exhausted": true,
                    }),
                );
                warn!(
                    workflow_id,
                    step,
                    attempts = attempt,
                    total_delay_ms = state.total_delay.as_millis() as u64,
                    last_error = ?state.last_error.as_ref().map(|e| &e.message),
                    "Retries exhausted"
                );
                return Err(AgentFailure::exhausted(failure, attempt));
            }

            let delay = self.delay_for(attempt - 1);
            self.audit.emit(
                workflow_id,
                step,
                AuditKind::Attempt,
                json!({
                    "attempt": attempt,
                    "outcome": "failure",
                    "kind": failure.kind,
                    "message": failure.message,
                    "retry": true,
                    "delay_ms": delay.as_millis() as u64,
                }),
            );
            debug!(workflow_id, step, attempt, delay_ms = delay.as_millis() as u64, "Retrying");

            state.total_delay += delay;
            state.last_error = Some(failure);
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }
}
