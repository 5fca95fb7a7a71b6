//! Fallback chains
//!
//! When a step fails for good, the [`FallbackHandler`] walks an ordered list
//! of [`FallbackStrategy`] values and returns the first one that produces a
//! result. Strategies run inside the isolation boundary, so a misbehaving
//! strategy counts as one more failed link instead of aborting the chain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentHandle;
use crate::audit::{AuditKind, AuditLogger};
use crate::context::ReliabilityContext;
use crate::error::AgentFailure;
use crate::isolation::isolate;
use crate::task::{AgentCaller, AgentResult, Task};

/// One alternative way of producing a step result
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a success hands the work to a human
    fn escalates(&self) -> bool {
        false
    }

    async fn attempt(
        &self,
        workflow_id: &str,
        step: &str,
        task: &Task,
        cause: &AgentFailure,
    ) -> AgentResult;
}

/// Result produced by a fallback strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSuccess {
    pub value: Value,
    pub strategy: String,
    pub escalated: bool,
}

/// Ordered chain of fallback strategies
#[derive(Clone)]
pub struct FallbackHandler {
    strategies: Vec<Arc<dyn FallbackStrategy>>,
    audit: Arc<AuditLogger>,
}

impl FallbackHandler {
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            strategies: Vec::new(),
            audit,
        }
    }

    /// Append a strategy to the end of the chain
    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Try every strategy in order
    ///
    /// An empty chain hands `cause` back unchanged. Otherwise the failure of a
    /// fully exhausted chain aggregates `cause` followed by one failure per
    /// strategy.
    pub async fn execute(
        &self,
        workflow_id: &str,
        step: &str,
        task: &Task,
        cause: AgentFailure,
    ) -> Result<FallbackSuccess, AgentFailure> {
        if self.strategies.is_empty() {
            return Err(cause);
        }

        let mut causes = Vec::with_capacity(self.strategies.len() + 1);
        for strategy in &self.strategies {
            match isolate(strategy.attempt(workflow_id, step, task, &cause)).await {
                Ok(value) => {
                    let escalated = strategy.escalates();
                    let kind = if escalated {
                        AuditKind::Escalation
                    } else {
                        AuditKind::FallbackUsed
                    };
                    self.audit.emit(
                        workflow_id,
                        step,
                        kind,
                        json!({
                            "strategy": strategy.name(),
                            "cause": cause.kind,
                            "message": cause.message,
                            "skipped": causes.len(),
                        }),
                    );
                    info!(
                        workflow_id,
                        step,
                        strategy = strategy.name(),
                        escalated,
                        "Fallback strategy succeeded"
                    );
                    return Ok(FallbackSuccess {
                        value,
                        strategy: strategy.name().to_string(),
                        escalated,
                    });
                }
                Err(failure) => {
                    warn!(
                        workflow_id,
                        step,
                        strategy = strategy.name(),
                        kind = %failure.kind,
                        "Fallback strategy failed"
                    );
                    causes.push(failure);
                }
            }
        }

        causes.insert(0, cause);
        Err(AgentFailure::all_fallbacks_exhausted(causes))
    }
}

/// Retry the task on another agent (a simpler model, another provider)
pub struct AgentStrategy {
    name: String,
    agent: AgentHandle,
}

impl AgentStrategy {
    pub fn new(caller: Arc<dyn AgentCaller>, ctx: Arc<ReliabilityContext>) -> Self {
        let agent = AgentHandle::new(caller, ctx);
        Self {
            name: format!("agent:{}", agent.target()),
            agent,
        }
    }
}

#[async_trait]
impl FallbackStrategy for AgentStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(
        &self,
        workflow_id: &str,
        step: &str,
        task: &Task,
        _cause: &AgentFailure,
    ) -> AgentResult {
        self.agent.call(workflow_id, step, task).await
    }
}

/// Answer with a fixed value
pub struct CachedAnswer {
    value: Value,
}

impl CachedAnswer {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl FallbackStrategy for CachedAnswer {
    fn name(&self) -> &str {
        "cached-answer"
    }

    async fn attempt(&self, _: &str, _: &str, _: &Task, _: &AgentFailure) -> AgentResult {
        Ok(self.value.clone())
    }
}

/// Hand the task to a human; the workflow ends `Escalated`
#[derive(Default)]
pub struct EscalateToHuman {
    queue: Option<String>,
}

impl EscalateToHuman {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the queue the ticket is filed under
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

#[async_trait]
impl FallbackStrategy for EscalateToHuman {
    fn name(&self) -> &str {
        "escalate-to-human"
    }

    fn escalates(&self) -> bool {
        true
    }

    async fn attempt(
        &self,
        workflow_id: &str,
        step: &str,
        task: &Task,
        cause: &AgentFailure,
    ) -> AgentResult {
        Ok(json!({
            "ticket": Uuid::new_v4().to_string(),
            "queue": self.queue,
            "workflow_id": workflow_id,
            "step": step,
            "task": task.id,
            "payload": task.payload,
            "reason": cause.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::error::FailureKind;
    use crate::testing::ScriptedCaller;

    struct Broken;

    #[async_trait]
    impl FallbackStrategy for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn attempt(&self, _: &str, _: &str, _: &Task, _: &AgentFailure) -> AgentResult {
            let empty: Vec<Value> = Vec::new();
            Ok(empty[0].clone())
        }
    }

    fn context() -> Arc<ReliabilityContext> {
        let mut config = WorkflowConfig::default();
        config.retry.max_attempts = 1;
        ReliabilityContext::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_empty_chain_returns_cause() {
        let ctx = context();
        let handler = FallbackHandler::new(Arc::clone(ctx.audit()));
        let cause = AgentFailure::permanent("bad");

        let result = handler.execute("wf", "s", &Task::new(json!({})), cause.clone()).await;
        assert_eq!(result.unwrap_err(), cause);
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let ctx = context();
        let backup = Arc::new(ScriptedCaller::new("small-model").succeed(json!("from backup")));
        let handler = FallbackHandler::new(Arc::clone(ctx.audit()))
            .with_strategy(Arc::new(Broken))
            .with_strategy(Arc::new(AgentStrategy::new(backup.clone(), Arc::clone(&ctx))))
            .with_strategy(Arc::new(CachedAnswer::new(json!("cached"))));

        let success = handler
            .execute("wf", "s", &Task::new(json!({})), AgentFailure::permanent("bad"))
            .await
            .unwrap();

        assert_eq!(success.value, json!("from backup"));
        assert_eq!(success.strategy, "agent:small-model");
        assert!(!success.escalated);
        assert_eq!(backup.calls(), 1);

        let trail = ctx.audit().trail("wf");
        let used = trail.iter().find(|e| e.kind == AuditKind::FallbackUsed).unwrap();
        assert_eq!(used.detail["strategy"], "agent:small-model");
        assert_eq!(used.detail["skipped"], 1);
    }

    #[tokio::test]
    async fn test_escalation_is_flagged() {
        let ctx = context();
        let handler = FallbackHandler::new(Arc::clone(ctx.audit()))
            .with_strategy(Arc::new(EscalateToHuman::new().queue("triage")));
        let task = Task::with_id("t1", json!({"prompt": "x"}));

        let success = handler
            .execute("wf", "s", &task, AgentFailure::permanent("bad"))
            .await
            .unwrap();

        assert!(success.escalated);
        assert_eq!(success.value["queue"], "triage");
        assert_eq!(success.value["task"], "t1");
        assert!(ctx
            .audit()
            .trail("wf")
            .iter()
            .any(|e| e.kind == AuditKind::Escalation));
    }

    #[tokio::test]
    async fn test_exhausted_chain_keeps_every_cause() {
        let ctx = context();
        let backup = Arc::new(
            ScriptedCaller::new("small-model").fail_always(AgentFailure::permanent("also bad")),
        );
        let handler = FallbackHandler::new(Arc::clone(ctx.audit()))
            .with_strategy(Arc::new(AgentStrategy::new(backup, Arc::clone(&ctx))))
            .with_strategy(Arc::new(Broken));

        let failure = handler
            .execute("wf", "s", &Task::new(json!({})), AgentFailure::transient("503"))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::AllFallbacksExhausted);
        assert_eq!(failure.causes.len(), 3);
        assert_eq!(failure.causes[0].message, "503");
        assert_eq!(failure.causes[1].message, "also bad");
        assert!(failure.causes[2].message.starts_with("internal error"));
    }
}
