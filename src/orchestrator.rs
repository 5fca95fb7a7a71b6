//! Orchestrator - one entry point for every workflow pattern

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::audit::AuditEvent;
use crate::hierarchy::HierarchicalCoordinator;
use crate::iterative::IterativeRefiner;
use crate::sequential::SequentialPipeline;
use crate::session::StepRecord;
use crate::state_machine::StateMachine;
use crate::task::{AgentCaller, Task};
use crate::voting::{Verdict, VotingEnsemble};

/// Workflow pattern names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Sequential,
    Hierarchical,
    Iterative,
    StateMachine,
    Voting,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pattern::Sequential => "sequential",
            Pattern::Hierarchical => "hierarchical",
            Pattern::Iterative => "iterative",
            Pattern::StateMachine => "state_machine",
            Pattern::Voting => "voting",
        };
        f.write_str(name)
    }
}

/// Terminal status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Succeeded,
    /// Some work completed before an unrecoverable failure
    PartialFailure,
    Failed,
    /// A fallback handed the work to a human
    Escalated,
    /// Iteration cap reached; the last output is still reported
    ConvergenceFailed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::PartialFailure => "partial_failure",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Escalated => "escalated",
            WorkflowStatus::ConvergenceFailed => "convergence_failed",
        };
        f.write_str(name)
    }
}

/// Everything a finished workflow reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub pattern: Pattern,
    pub status: WorkflowStatus,
    /// Per-task results in execution order (task order for fan-out patterns)
    pub steps: Vec<StepRecord>,
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Step index the run resumed from, if a checkpoint was found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<usize>,
    pub audit_trail: Vec<AuditEvent>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }

    /// Steps that ended in a failure
    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| !s.is_ok())
    }
}

/// The workflow patterns, behind a single `run`
pub enum Orchestrator {
    Sequential(SequentialPipeline),
    Hierarchical(HierarchicalCoordinator),
    Iterative(IterativeRefiner),
    StateMachine(StateMachine),
    Voting(VotingEnsemble),
}

impl Orchestrator {
    pub fn pattern(&self) -> Pattern {
        match self {
            Orchestrator::Sequential(_) => Pattern::Sequential,
            Orchestrator::Hierarchical(_) => Pattern::Hierarchical,
            Orchestrator::Iterative(_) => Pattern::Iterative,
            Orchestrator::StateMachine(_) => Pattern::StateMachine,
            Orchestrator::Voting(_) => Pattern::Voting,
        }
    }

    /// Run a workflow to a terminal status
    ///
    /// A checkpoint stored under `workflow_id` resumes the run instead of
    /// starting over.
    #[instrument(skip(self, tasks, caller), fields(pattern = %self.pattern(), tasks = tasks.len()))]
    pub async fn run(
        &self,
        workflow_id: &str,
        tasks: Vec<Task>,
        caller: Arc<dyn AgentCaller>,
    ) -> WorkflowResult {
        match self {
            Orchestrator::Sequential(p) => p.run(workflow_id, tasks, caller).await,
            Orchestrator::Hierarchical(p) => p.run(workflow_id, tasks, caller).await,
            Orchestrator::Iterative(p) => p.run(workflow_id, tasks, caller).await,
            Orchestrator::StateMachine(p) => p.run(workflow_id, tasks, caller).await,
            Orchestrator::Voting(p) => p.run(workflow_id, tasks, caller).await,
        }
    }
}

impl From<SequentialPipeline> for Orchestrator {
    fn from(p: SequentialPipeline) -> Self {
        Orchestrator::Sequential(p)
    }
}

impl From<HierarchicalCoordinator> for Orchestrator {
    fn from(p: HierarchicalCoordinator) -> Self {
        Orchestrator::Hierarchical(p)
    }
}

impl From<IterativeRefiner> for Orchestrator {
    fn from(p: IterativeRefiner) -> Self {
        Orchestrator::Iterative(p)
    }
}

impl From<StateMachine> for Orchestrator {
    fn from(p: StateMachine) -> Self {
        Orchestrator::StateMachine(p)
    }
}

impl From<VotingEnsemble> for Orchestrator {
    fn from(p: VotingEnsemble) -> Self {
        Orchestrator::Voting(p)
    }
}
