//! Workflow sessions - the runtime bookkeeping of one workflow run

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::AgentHandle;
use crate::audit::AuditKind;
use crate::checkpoint::Checkpoint;
use crate::context::ReliabilityContext;
use crate::fallback::FallbackHandler;
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::task::{AgentResult, Task, TaskId};
use crate::voting::Verdict;

/// Result of one step, after fallback
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: AgentResult,
    /// Strategy that rescued the step, if any
    pub fallback: Option<String>,
    pub escalated: bool,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Entry of a workflow's step trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub result: AgentResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default)]
    pub escalated: bool,
}

impl StepRecord {
    pub fn new(step: impl Into<String>, task_id: Option<TaskId>, outcome: StepOutcome) -> Self {
        Self {
            step: step.into(),
            task_id,
            result: outcome.result,
            fallback: outcome.fallback,
            escalated: outcome.escalated,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Call the agent for one step and route a failure through the fallback chain
pub async fn dispatch(
    agent: &AgentHandle,
    fallback: &FallbackHandler,
    workflow_id: &str,
    step: &str,
    task: &Task,
) -> StepOutcome {
    match agent.call(workflow_id, step, task).await {
        Ok(value) => StepOutcome {
            result: Ok(value),
            fallback: None,
            escalated: false,
        },
        Err(cause) => match fallback.execute(workflow_id, step, task, cause).await {
            Ok(success) => StepOutcome {
                result: Ok(success.value),
                fallback: Some(success.strategy),
                escalated: success.escalated,
            },
            Err(failure) => StepOutcome {
                result: Err(failure),
                fallback: None,
                escalated: false,
            },
        },
    }
}

/// Bookkeeping for one run of a workflow
pub struct WorkflowSession {
    workflow_id: String,
    pattern: Pattern,
    ctx: Arc<ReliabilityContext>,
    steps: Vec<StepRecord>,
    resumed_from: Option<usize>,
    escalated: bool,
    started: Instant,
}

impl WorkflowSession {
    /// Open a session and record `workflow-started`
    pub fn start(
        ctx: &Arc<ReliabilityContext>,
        workflow_id: &str,
        pattern: Pattern,
        task_count: usize,
    ) -> Self {
        info!(workflow_id, pattern = %pattern, task_count, "Starting workflow");
        ctx.audit().emit(
            workflow_id,
            "workflow",
            AuditKind::WorkflowStarted,
            json!({ "pattern": pattern, "tasks": task_count }),
        );

        Self {
            workflow_id: workflow_id.to_string(),
            pattern,
            ctx: Arc::clone(ctx),
            steps: Vec::new(),
            resumed_from: None,
            escalated: false,
            started: Instant::now(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn context(&self) -> &Arc<ReliabilityContext> {
        &self.ctx
    }

    /// Load the latest checkpoint and decode its state
    ///
    /// A missing, unreadable or undecodable checkpoint means a fresh start;
    /// the last two are logged.
    pub async fn resume<S: DeserializeOwned>(&mut self) -> Option<(usize, S)> {
        let checkpoint = match self.ctx.checkpoints().load(&self.workflow_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return None,
            Err(e) => {
                warn!(workflow_id = %self.workflow_id, error = %e, "Could not load checkpoint, starting fresh");
                return None;
            }
        };

        let state = match serde_json::from_value::<S>(checkpoint.state) {
            Ok(state) => state,
            Err(e) => {
                warn!(workflow_id = %self.workflow_id, error = %e, "Checkpoint state does not match this workflow, starting fresh");
                return None;
            }
        };

        info!(
            workflow_id = %self.workflow_id,
            step_index = checkpoint.step_index,
            step = %checkpoint.step_name,
            "Resuming workflow from checkpoint"
        );
        self.ctx.audit().emit(
            &self.workflow_id,
            &checkpoint.step_name,
            AuditKind::Resumed,
            json!({ "step_index": checkpoint.step_index, "checkpointed_at": checkpoint.created_at }),
        );
        self.resumed_from = Some(checkpoint.step_index);
        Some((checkpoint.step_index, state))
    }

    /// Persist progress; a failed write is logged and audited, never fatal
    pub async fn checkpoint<S: Serialize>(&self, step_index: usize, step_name: &str, state: &S) {
        let outcome = match serde_json::to_value(state) {
            Ok(state) => {
                let checkpoint = Checkpoint::new(&self.workflow_id, step_index, step_name, state);
                self.ctx
                    .checkpoints()
                    .save(&checkpoint)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        let detail = match &outcome {
            Ok(()) => {
                debug!(workflow_id = %self.workflow_id, step_index, step = step_name, "Checkpoint saved");
                json!({ "step_index": step_index, "saved": true })
            }
            Err(error) => {
                warn!(workflow_id = %self.workflow_id, step_index, error = %error, "Checkpoint write failed");
                json!({ "step_index": step_index, "saved": false, "error": error })
            }
        };
        self.ctx
            .audit()
            .emit(&self.workflow_id, step_name, AuditKind::Checkpoint, detail);
    }

    pub fn record(&mut self, record: StepRecord) {
        self.escalated |= record.escalated;
        self.steps.push(record);
    }

    /// Reinstate the trail carried by a checkpoint
    pub fn restore(&mut self, steps: Vec<StepRecord>) {
        self.escalated |= steps.iter().any(|s| s.escalated);
        self.steps = steps;
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn mark_escalated(&mut self) {
        self.escalated = true;
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }

    pub fn resumed_from(&self) -> Option<usize> {
        self.resumed_from
    }

    /// Close the session
    ///
    /// An escalated workflow reports `Escalated` unless it failed outright.
    pub fn finish(
        self,
        status: WorkflowStatus,
        output: Option<Value>,
        verdict: Option<Verdict>,
    ) -> WorkflowResult {
        let status = match status {
            WorkflowStatus::Succeeded | WorkflowStatus::PartialFailure if self.escalated => {
                WorkflowStatus::Escalated
            }
            other => other,
        };
        let elapsed_ms = self.started.elapsed().as_millis() as u64;

        info!(
            workflow_id = %self.workflow_id,
            status = %status,
            steps = self.steps.len(),
            elapsed_ms,
            "Workflow finished"
        );
        self.ctx.audit().emit(
            &self.workflow_id,
            "workflow",
            AuditKind::WorkflowFinished,
            json!({ "status": status, "steps": self.steps.len(), "elapsed_ms": elapsed_ms }),
        );

        WorkflowResult {
            audit_trail: self.ctx.audit().trail(&self.workflow_id),
            workflow_id: self.workflow_id,
            pattern: self.pattern,
            status,
            steps: self.steps,
            output,
            verdict,
            resumed_from: self.resumed_from,
        }
    }
}
