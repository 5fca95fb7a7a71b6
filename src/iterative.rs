//! Iterative refinement
//!
//! The agent is called repeatedly with its previous output and feedback until
//! a [`Convergence`] check passes or the iteration cap is reached. Hitting the
//! cap is reported as `ConvergenceFailed`, not as an error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentHandle;
use crate::context::ReliabilityContext;
use crate::error::AgentFailure;
use crate::fallback::{FallbackHandler, FallbackStrategy};
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::session::{dispatch, StepOutcome, StepRecord, WorkflowSession};
use crate::task::{AgentCaller, Task};
use crate::validate::{extract_json, Validator};

/// Verdict of a convergence check on one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub converged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Fed back to the agent on the next iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Assessment {
    pub fn converged() -> Self {
        Self {
            converged: true,
            score: None,
            feedback: None,
        }
    }

    pub fn retry(feedback: impl Into<String>) -> Self {
        Self {
            converged: false,
            score: None,
            feedback: Some(feedback.into()),
        }
    }
}

/// Decides whether an output is good enough
pub trait Convergence: Send + Sync {
    fn assess(&self, output: &Value) -> Assessment;
}

/// Converged once the output validates
impl Convergence for Validator {
    fn assess(&self, output: &Value) -> Assessment {
        match self.validate(output) {
            Ok(_) => Assessment::converged(),
            Err(failure) => Assessment::retry(failure.message),
        }
    }
}

/// Converged once a numeric field reaches a threshold
#[derive(Debug, Clone)]
pub struct ScoreThreshold {
    /// JSON pointer to the score, e.g. `/review/score`
    pointer: String,
    threshold: f64,
}

impl ScoreThreshold {
    pub fn new(pointer: impl Into<String>, threshold: f64) -> Self {
        Self {
            pointer: pointer.into(),
            threshold,
        }
    }
}

impl Convergence for ScoreThreshold {
    fn assess(&self, output: &Value) -> Assessment {
        let document = match output {
            Value::String(text) => extract_json(text).unwrap_or_else(|| output.clone()),
            other => other.clone(),
        };

        match document.pointer(&self.pointer).and_then(Value::as_f64) {
            Some(score) => Assessment {
                converged: score >= self.threshold,
                score: Some(score),
                feedback: (score < self.threshold).then(|| {
                    format!("score {} is below the threshold of {}", score, self.threshold)
                }),
            },
            None => Assessment::retry(format!("no numeric score at {}", self.pointer)),
        }
    }
}

/// Checkpointed after every answered iteration
#[derive(Debug, Default, Serialize, Deserialize)]
struct RefinementState {
    iteration: u32,
    previous: Option<Value>,
    feedback: Option<String>,
    converged: bool,
    steps: Vec<StepRecord>,
}

pub struct IterativeRefiner {
    ctx: Arc<ReliabilityContext>,
    fallback: FallbackHandler,
    convergence: Arc<dyn Convergence>,
}

impl IterativeRefiner {
    pub fn new(ctx: Arc<ReliabilityContext>, convergence: Arc<dyn Convergence>) -> Self {
        let fallback = FallbackHandler::new(Arc::clone(ctx.audit()));
        Self {
            ctx,
            fallback,
            convergence,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackHandler) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = self.fallback.with_strategy(strategy);
        self
    }

    /// Refine the first task of `tasks`
    #[instrument(skip(self, tasks, caller), fields(workflow_id = %workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        tasks: Vec<Task>,
        caller: Arc<dyn AgentCaller>,
    ) -> WorkflowResult {
        let mut session = WorkflowSession::start(&self.ctx, workflow_id, Pattern::Iterative, tasks.len());
        let Some(task) = tasks.into_iter().next() else {
            session.record(StepRecord::new(
                "iteration",
                None,
                StepOutcome {
                    result: Err(AgentFailure::permanent("no task to refine")),
                    fallback: None,
                    escalated: false,
                },
            ));
            return session.finish(WorkflowStatus::Failed, None, None);
        };

        let agent = AgentHandle::new(caller, Arc::clone(&self.ctx));
        let max_iterations = self.ctx.config().max_iterations;

        let mut state = RefinementState::default();
        if let Some((_, resumed)) = session.resume::<RefinementState>().await {
            state = resumed;
            session.restore(std::mem::take(&mut state.steps));
            if state.converged {
                return session.finish(WorkflowStatus::Succeeded, state.previous, None);
            }
        }

        for iteration in state.iteration + 1..=max_iterations {
            let input = json!({
                "previous": state.previous,
                "feedback": state.feedback,
                "iteration": iteration,
            });
            let derived = task.with_input(input);
            let step = format!("iteration:{}", iteration);

            let outcome = dispatch(&agent, &self.fallback, workflow_id, &step, &derived).await;
            let result = outcome.result.clone();
            let escalated = outcome.escalated;
            session.record(StepRecord::new(&step, Some(task.id.clone()), outcome));

            let output = match result {
                Ok(output) => output,
                Err(failure) => {
                    warn!(iteration, kind = %failure.kind, "Refinement aborted");
                    return session.finish(WorkflowStatus::Failed, state.previous, None);
                }
            };

            if escalated {
                // The ticket is no draft; a rerun repeats this iteration
                info!(iteration, "Refinement handed to a human");
                return session.finish(WorkflowStatus::Escalated, Some(output), None);
            }

            let assessment = self.convergence.assess(&output);
            debug!(
                iteration,
                converged = assessment.converged,
                score = ?assessment.score,
                "Assessed iteration"
            );

            state.iteration = iteration;
            state.previous = Some(output);
            state.feedback = assessment.feedback;
            state.converged = assessment.converged;
            state.steps = session.steps().to_vec();
            session.checkpoint(iteration as usize, &step, &state).await;

            if assessment.converged {
                info!(iteration, "Refinement converged");
                return session.finish(WorkflowStatus::Succeeded, state.previous, None);
            }
        }

        warn!(max_iterations, "Refinement did not converge");
        session.finish(WorkflowStatus::ConvergenceFailed, state.previous, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::fallback::EscalateToHuman;
    use crate::testing::ScriptedCaller;
    use crate::validate::Schema;

    fn context(max_iterations: u32) -> Arc<ReliabilityContext> {
        let mut config = WorkflowConfig::default();
        config.max_iterations = max_iterations;
        config.retry.max_attempts = 1;
        ReliabilityContext::new(config).unwrap()
    }

    fn summary_schema() -> Validator {
        Validator::new(Schema::object().field("summary", Schema::string().length(1, 200)))
    }

    #[test]
    fn test_score_threshold() {
        let check = ScoreThreshold::new("/score", 0.8);

        assert!(check.assess(&json!({"score": 0.9})).converged);
        let low = check.assess(&json!({"score": 0.5}));
        assert!(!low.converged);
        assert_eq!(low.score, Some(0.5));
        assert!(low.feedback.unwrap().contains("below"));

        assert!(check.assess(&json!("Result: {\"score\": 0.95}")).converged);
        assert!(!check.assess(&json!({"other": 1})).converged);
    }

    #[test]
    fn test_validator_feedback() {
        let assessment = summary_schema().assess(&json!({"summary": 3}));
        assert!(!assessment.converged);
        assert!(assessment.feedback.unwrap().contains("$.summary"));
    }

    #[tokio::test]
    async fn test_converges_and_feeds_back() {
        let ctx = context(5);
        let caller = Arc::new(
            ScriptedCaller::new("llm")
                .succeed(json!({"draft": "too long"}))
                .succeed(json!({"summary": "short"})),
        );
        let refiner = IterativeRefiner::new(Arc::clone(&ctx), Arc::new(summary_schema()));

        let result = refiner
            .run("wf", vec![Task::new(json!({"prompt": "summarize"}))], caller.clone())
            .await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.output, Some(json!({"summary": "short"})));
        assert_eq!(caller.calls(), 2);

        let second = &caller.seen()[1];
        let input = second.input.as_ref().unwrap();
        assert_eq!(input["iteration"], 2);
        assert_eq!(input["previous"], json!({"draft": "too long"}));
        assert!(input["feedback"].as_str().unwrap().contains("summary"));
    }

    #[tokio::test]
    async fn test_cap_reports_convergence_failed() {
        let ctx = context(5);
        let caller = Arc::new(ScriptedCaller::new("llm"));
        let refiner = IterativeRefiner::new(Arc::clone(&ctx), Arc::new(summary_schema()));

        let result = refiner.run("wf", vec![Task::new(json!({}))], caller.clone()).await;

        assert_eq!(result.status, WorkflowStatus::ConvergenceFailed);
        assert_eq!(caller.calls(), 5);
        assert_eq!(result.steps.len(), 5);
        assert!(result.output.is_some());
    }

    #[tokio::test]
    async fn test_agent_failure_is_failed() {
        let ctx = context(5);
        let caller = Arc::new(ScriptedCaller::new("llm").fail_always(AgentFailure::permanent("refused")));
        let refiner = IterativeRefiner::new(ctx, Arc::new(summary_schema()));

        let result = refiner.run("wf", vec![Task::new(json!({}))], caller.clone()).await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(caller.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_task() {
        let ctx = context(5);
        let refiner = IterativeRefiner::new(ctx, Arc::new(summary_schema()));
        let result = refiner.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_escalated_iteration_is_repeated_on_rerun() {
        let ctx = context(5);
        let refiner = IterativeRefiner::new(Arc::clone(&ctx), Arc::new(summary_schema()))
            .with_strategy(Arc::new(EscalateToHuman::new()));
        let task = Task::with_id("essay", json!({}));

        let flaky = Arc::new(
            ScriptedCaller::new("llm")
                .succeed(json!({"draft": "too long"}))
                .fail(AgentFailure::permanent("unsafe")),
        );
        let first = refiner.run("wf", vec![task.clone()], flaky).await;
        assert_eq!(first.status, WorkflowStatus::Escalated);

        let healthy = Arc::new(ScriptedCaller::new("llm").succeed(json!({"summary": "short"})));
        let second = refiner.run("wf", vec![task], healthy.clone()).await;

        assert_eq!(second.status, WorkflowStatus::Succeeded);
        assert_eq!(second.resumed_from, Some(1));
        let input = healthy.seen()[0].input.clone().unwrap();
        assert_eq!(input["iteration"], 2);
        assert_eq!(input["previous"], json!({"draft": "too long"}));
        assert!(second.steps.iter().all(|s| !s.escalated));
    }

    #[tokio::test]
    async fn test_resume_continues_iteration_count() {
        let ctx = context(3);
        let refiner = IterativeRefiner::new(Arc::clone(&ctx), Arc::new(summary_schema()));
        let task = Task::with_id("essay", json!({}));

        let first = refiner
            .run("wf", vec![task.clone()], Arc::new(ScriptedCaller::new("llm")))
            .await;
        assert_eq!(first.status, WorkflowStatus::ConvergenceFailed);

        // Cap already spent: nothing left to run
        let caller = Arc::new(ScriptedCaller::new("llm"));
        let second = refiner.run("wf", vec![task], caller.clone()).await;
        assert_eq!(second.status, WorkflowStatus::ConvergenceFailed);
        assert_eq!(second.resumed_from, Some(3));
        assert_eq!(caller.calls(), 0);
        assert_eq!(second.steps.len(), 3);
    }
}
