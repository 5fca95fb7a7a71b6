//! Sequential pipeline
//!
//! Tasks run strictly in order; each task after the first receives the
//! previous output as its `input`. The first unrecoverable failure stops the
//! pipeline and later tasks are never attempted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::agent::AgentHandle;
use crate::context::ReliabilityContext;
use crate::fallback::{FallbackHandler, FallbackStrategy};
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::session::{dispatch, StepRecord, WorkflowSession};
use crate::task::{AgentCaller, Task};

/// Checkpointed after every completed, non-escalated task
#[derive(Debug, Serialize, Deserialize)]
struct PipelineState {
    steps: Vec<StepRecord>,
    last_output: Option<Value>,
}

pub struct SequentialPipeline {
    ctx: Arc<ReliabilityContext>,
    fallback: FallbackHandler,
}

impl SequentialPipeline {
    pub fn new(ctx: Arc<ReliabilityContext>) -> Self {
        let fallback = FallbackHandler::new(Arc::clone(ctx.audit()));
        Self { ctx, fallback }
    }

    pub fn with_fallback(mut self, fallback: FallbackHandler) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = self.fallback.with_strategy(strategy);
        self
    }

    #[instrument(skip(self, tasks, caller), fields(workflow_id = %workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        tasks: Vec<Task>,
        caller: Arc<dyn AgentCaller>,
    ) -> WorkflowResult {
        let mut session =
            WorkflowSession::start(&self.ctx, workflow_id, Pattern::Sequential, tasks.len());
        let agent = AgentHandle::new(caller, Arc::clone(&self.ctx));

        let mut next = 0;
        let mut previous: Option<Value> = None;
        if let Some((index, state)) = session.resume::<PipelineState>().await {
            next = index.min(tasks.len());
            previous = state.last_output;
            session.restore(state.steps);
        }

        for (index, task) in tasks.iter().enumerate().skip(next) {
            let task = match &previous {
                Some(output) if index > 0 => task.with_input(output.clone()),
                _ => task.clone(),
            };
            let step = format!("task:{}", task.id);
            debug!(index, step = %step, "Running pipeline step");

            let outcome = dispatch(&agent, &self.fallback, workflow_id, &step, &task).await;
            let result = outcome.result.clone();
            let escalated = outcome.escalated;
            session.record(StepRecord::new(&step, Some(task.id.clone()), outcome));

            match result {
                Ok(ticket) if escalated => {
                    // Not checkpointed: a rerun asks again instead of feeding
                    // the ticket forward
                    debug!(step = %step, "Step escalated, stopping pipeline");
                    return session.finish(WorkflowStatus::Escalated, Some(ticket), None);
                }
                Ok(output) => {
                    previous = Some(output);
                    let state = PipelineState {
                        steps: session.steps().to_vec(),
                        last_output: previous.clone(),
                    };
                    session.checkpoint(index + 1, &step, &state).await;
                }
                Err(failure) => {
                    warn!(step = %step, kind = %failure.kind, "Pipeline aborted");
                    let status = if index == 0 {
                        WorkflowStatus::Failed
                    } else {
                        WorkflowStatus::PartialFailure
                    };
                    return session.finish(status, previous, None);
                }
            }
        }

        session.finish(WorkflowStatus::Succeeded, previous, None)
    }
}
