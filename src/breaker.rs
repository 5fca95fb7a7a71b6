//! Per-target circuit breakers
//!
//! ```text
//!            F failures within W
//!   CLOSED ───────────────────────▶ OPEN ◀──────────────┐
//!     ▲                              │ cool-down elapsed │ trial failed
//!     │ trial succeeded              ▼                   │ (cool-down x2)
//!     └─────────────────────────  HALF_OPEN ─────────────┘
//! ```
//!
//! A breaker only admits one trial while half-open; concurrent callers are
//! rejected with `CircuitOpen` until the trial settles.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::{AuditKind, AuditLogger};
use crate::config::BreakerConfig;
use crate::error::AgentFailure;
use crate::task::AgentResult;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    /// Timestamps of qualifying failures while closed
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    trips: u64,
    rejected: u64,
}

/// Read-only view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub cooldown_ms: u64,
    /// Times the circuit went to OPEN
    pub trips: u64,
    /// Calls refused without reaching the agent
    pub rejected: u64,
}

/// Failure-rate gate for one logical target
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
///
/// Dropping an unsettled trial permit frees the trial slot so a cancelled
/// trial cannot wedge the breaker in HALF_OPEN.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Feed the call outcome back; returns the new state on a transition
    pub fn settle(mut self, result: &AgentResult) -> Option<CircuitState> {
        self.settled = true;
        self.breaker.on_result(self.trial, result)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                cooldown,
                trial_in_flight: false,
                trips: 0,
                rejected: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask for permission to call the target
    pub fn try_acquire(&self) -> Result<Permit<'_>, AgentFailure> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(target_id = %self.target, "Circuit breaker: OPEN -> HALF_OPEN, admitting trial");
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                } else {
                    inner.rejected += 1;
                    Err(AgentFailure::circuit_open(&self.target, inner.cooldown - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Err(AgentFailure::circuit_open(&self.target, Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                }
            }
        }
    }

    fn on_result(&self, trial: bool, result: &AgentResult) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let failed = matches!(result, Err(failure) if failure.trips_circuit());

        if trial {
            inner.trial_in_flight = false;
            if failed {
                let doubled = inner.cooldown.saturating_mul(2);
                inner.cooldown = doubled.min(self.config.max_cooldown());
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trips += 1;
                warn!(
                    target_id = %self.target,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "Circuit breaker: trial failed, HALF_OPEN -> OPEN"
                );
                return Some(CircuitState::Open);
            }
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
            inner.cooldown = self.config.cooldown();
            info!(target_id = %self.target, "Circuit breaker: trial succeeded, HALF_OPEN -> CLOSED");
            return Some(CircuitState::Closed);
        }

        // Calls admitted before the circuit opened may land late; they carry no new information.
        if inner.state != CircuitState::Closed || !failed {
            return None;
        }

        let window = self.config.window();
        inner.failures.push_back(now);
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if inner.failures.len() as u32 >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.cooldown = self.config.cooldown();
            inner.failures.clear();
            inner.trips += 1;
            warn!(
                target_id = %self.target,
                threshold = self.config.failure_threshold,
                "Circuit breaker: CLOSED -> OPEN"
            );
            return Some(CircuitState::Open);
        }

        None
    }

    /// Gate a call; `call` is not invoked when the circuit refuses it
    pub async fn call<F, Fut>(&self, call: F) -> AgentResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult>,
    {
        let permit = self.try_acquire()?;
        let result = call().await;
        permit.settle(&result);
        result
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            recent_failures: inner.failures.len(),
            cooldown_ms: inner.cooldown.as_millis() as u64,
            trips: inner.trips,
            rejected: inner.rejected,
        }
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.cooldown = self.config.cooldown();
        inner.trial_in_flight = false;
        info!(target_id = %self.target, "Circuit breaker reset");
    }
}

/// One breaker per logical target, created on first use
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    audit: Arc<AuditLogger>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            audit,
        }
    }

    /// Get or create the breaker for `target`
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(target) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())));
        Arc::clone(breaker)
    }

    /// Gate `call` with the breaker of `target`, auditing rejections and transitions
    pub async fn guard<F, Fut>(&self, target: &str, workflow_id: &str, step: &str, call: F) -> AgentResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult>,
    {
        let breaker = self.breaker(target);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(failure) => {
                self.audit.emit(
                    workflow_id,
                    step,
                    AuditKind::CircuitOpen,
                    json!({ "target": target, "rejected": true, "message": failure.message }),
                );
                return Err(failure);
            }
        };

        let result = call().await;

        match permit.settle(&result) {
            Some(CircuitState::Open) => {
                let cooldown_ms = breaker.snapshot().cooldown_ms;
                self.audit.emit(
                    workflow_id,
                    step,
                    AuditKind::CircuitOpen,
                    json!({ "target": target, "rejected": false, "cooldown_ms": cooldown_ms }),
                );
            }
            Some(CircuitState::Closed) => {
                self.audit.emit(
                    workflow_id,
                    step,
                    AuditKind::CircuitClosed,
                    json!({ "target": target }),
                );
            }
            _ => {}
        }

        result
    }

    /// Snapshot of every breaker, ordered by target
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            window_ms: 1_000,
            cooldown_ms: 500,
            max_cooldown_ms: 1_500,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> AgentResult {
        breaker.call(|| async { Err(AgentFailure::transient("503")) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> AgentResult {
        breaker.call(|| async { Ok(json!("ok")) }).await
    }

    // === Opening ===

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_threshold_failure() {
        let breaker = CircuitBreaker::new("llm", config(3));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new("llm", config(3));

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_100)).await;
        fail(&breaker).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_do_not_trip() {
        let breaker = CircuitBreaker::new("llm", config(1));
        breaker
            .call(|| async { Err(AgentFailure::permanent("schema violation")) })
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_calling() {
        let breaker = CircuitBreaker::new("llm", config(1));
        fail(&breaker).await.unwrap_err();

        let calls = AtomicU32::new(0);
        let result = breaker
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("never")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    // === Half-open probing ===

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new("llm", config(1));
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(500)).await;
        succeed(&breaker).await.unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().cooldown_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_doubles_cooldown() {
        let breaker = CircuitBreaker::new("llm", config(1));
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(500)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().cooldown_ms, 1_000);

        // Old cool-down is no longer enough
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(succeed(&breaker).await.unwrap_err().kind, FailureKind::CircuitOpen);

        tokio::time::advance(Duration::from_millis(500)).await;
        fail(&breaker).await.unwrap_err();
        // Capped at max_cooldown
        assert_eq!(breaker.snapshot().cooldown_ms, 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_admitted() {
        let breaker = CircuitBreaker::new("llm", config(1));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(500)).await;

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let second = breaker.try_acquire();
        assert_eq!(second.err().map(|f| f.kind), Some(FailureKind::CircuitOpen));

        trial.settle(&Ok(json!("ok")));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let breaker = CircuitBreaker::new("llm", config(1));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(500)).await;

        drop(breaker.try_acquire().unwrap());

        let again = breaker.try_acquire().unwrap();
        assert!(again.is_trial());
    }

    // === Registry ===

    #[tokio::test(start_paused = true)]
    async fn test_registry_targets_are_independent() {
        let audit = Arc::new(AuditLogger::new());
        let registry = BreakerRegistry::new(config(1), Arc::clone(&audit));

        registry
            .guard("a", "wf", "s", || async { Err(AgentFailure::transient("down")) })
            .await
            .unwrap_err();
        let b = registry.guard("b", "wf", "s", || async { Ok(json!(1)) }).await;

        assert!(b.is_ok());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].target, "a");
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[1].state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_audits_open_and_rejection() {
        let audit = Arc::new(AuditLogger::new());
        let registry = BreakerRegistry::new(config(1), Arc::clone(&audit));

        registry
            .guard("a", "wf", "s", || async { Err(AgentFailure::transient("down")) })
            .await
            .unwrap_err();
        registry
            .guard("a", "wf", "s", || async { Ok(json!(1)) })
            .await
            .unwrap_err();

        let kinds: Vec<_> = audit.trail("wf").iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::CircuitOpen, AuditKind::CircuitOpen]);
        assert_eq!(audit.trail("wf")[1].detail["rejected"], true);
    }
}
