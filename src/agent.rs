//! Agent handle - one external worker behind the reliability stack

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::audit::AuditKind;
use crate::context::ReliabilityContext;
use crate::isolation::isolate;
use crate::retry::RetryPolicy;
use crate::task::{AgentCaller, AgentResult, Task};

/// An [`AgentCaller`] wired to a [`ReliabilityContext`]
///
/// Every call runs as
/// `isolate(retry(breaker(isolate(caller.call(task)))))`: each retry attempt
/// is gated by the breaker of the caller's target, and neither a panic nor a
/// rejected circuit escapes as anything other than an [`AgentResult`].
#[derive(Clone)]
pub struct AgentHandle {
    caller: Arc<dyn AgentCaller>,
    ctx: Arc<ReliabilityContext>,
    retry: Arc<RetryPolicy>,
}

impl AgentHandle {
    pub fn new(caller: Arc<dyn AgentCaller>, ctx: Arc<ReliabilityContext>) -> Self {
        let retry = Arc::new(ctx.retry_policy());
        Self { caller, ctx, retry }
    }

    /// Use a custom retry policy instead of the context default
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    /// Breaker target of the wrapped caller
    pub fn target(&self) -> &str {
        self.caller.target()
    }

    pub fn context(&self) -> &Arc<ReliabilityContext> {
        &self.ctx
    }

    /// Call the agent for one workflow step
    #[instrument(skip(self, task), fields(target_id = %self.target(), task_id = %task.id))]
    pub async fn call(&self, workflow_id: &str, step: &str, task: &Task) -> AgentResult {
        let target = self.target();
        let caller = &self.caller;
        let breakers = self.ctx.breakers();

        let result = isolate(self.retry.execute(workflow_id, step, move |attempt| {
            debug!(attempt, "Dispatching task to agent");
            breakers.guard(target, workflow_id, step, move || isolate(caller.call(task)))
        }))
        .await;

        let audit = self.ctx.audit();
        match &result {
            Ok(_) => audit.emit(
                workflow_id,
                step,
                AuditKind::Success,
                json!({ "task": task.id, "target": target }),
            ),
            Err(failure) => {
                warn!(kind = %failure.kind, attempts = failure.attempts, "Agent call failed");
                audit.emit(
                    workflow_id,
                    step,
                    AuditKind::Failure,
                    json!({
                        "task": task.id,
                        "target": target,
                        "kind": failure.kind,
                        "message": failure.message,
                        "attempts": failure.attempts,
                    }),
                );
            }
        }

        result
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("target", &self.target())
            .finish()
    }
}
