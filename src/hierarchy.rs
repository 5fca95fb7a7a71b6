//! Hierarchical delegation
//!
//! The task list forms a tree through `parent` links. A coordinator decomposes
//! it into leaf subtasks, dispatches them concurrently under the configured
//! limit and aggregates their outputs in subtask order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentHandle;
use crate::context::ReliabilityContext;
use crate::error::{AgentFailure, FailureKind};
use crate::fallback::{FallbackHandler, FallbackStrategy};
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::session::{dispatch, StepRecord, WorkflowSession};
use crate::task::{AgentCaller, Task, TaskId};

/// Node in the task tree
#[derive(Debug, Clone)]
struct TreeNode {
    /// Position in the original task list
    index: usize,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
}

/// Parent/child structure of a task list
#[derive(Debug, Clone, Default)]
pub struct TaskTree {
    nodes: HashMap<TaskId, TreeNode>,
    /// Ids in task-list order
    order: Vec<TaskId>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tree; a parent id that is not in the list makes the task a root
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut tree = Self::new();
        for (index, task) in tasks.iter().enumerate() {
            tree.nodes.insert(
                task.id.clone(),
                TreeNode {
                    index,
                    parent: None,
                    children: Vec::new(),
                },
            );
            tree.order.push(task.id.clone());
        }

        for task in tasks {
            let Some(parent) = &task.parent else { continue };
            if parent == &task.id || !tree.nodes.contains_key(parent) {
                warn!(task_id = %task.id, parent = %parent, "Unknown parent, treating task as a root");
                continue;
            }
            if let Some(node) = tree.nodes.get_mut(&task.id) {
                node.parent = Some(parent.clone());
            }
            if let Some(node) = tree.nodes.get_mut(parent) {
                node.children.push(task.id.clone());
            }
        }

        tree
    }

    /// Tasks without a parent
    pub fn roots(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.parent(id).is_none())
            .cloned()
            .collect()
    }

    /// Tasks without children, in task-list order
    pub fn leaves(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.children(id).is_empty())
            .cloned()
            .collect()
    }

    pub fn parent(&self, id: &TaskId) -> Option<TaskId> {
        self.nodes.get(id).and_then(|n| n.parent.clone())
    }

    pub fn children(&self, id: &TaskId) -> Vec<TaskId> {
        self.nodes.get(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Position of a task in the original list
    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.nodes.get(id).map(|n| n.index)
    }

    /// Distance to the root; parent cycles stop the walk
    pub fn depth(&self, id: &TaskId) -> usize {
        let mut depth = 0;
        let mut current = self.parent(id);
        while let Some(parent) = current {
            depth += 1;
            if depth > self.nodes.len() {
                break;
            }
            current = self.parent(&parent);
        }
        depth
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Why dispatch stopped before every subtask finished
#[derive(Debug, Clone, Copy, PartialEq)]
enum EarlyStop {
    Quorum,
    Deadline,
}

/// What the drain loop saw next
enum Drain<T> {
    Finished(T),
    /// Every subtask has reported
    Done,
    Deadline,
    /// The in-flight checkpoint write completed
    Saved,
}

/// Next completed subtask, or the deadline if it comes first
async fn next_before<S>(deadline: Option<Instant>, in_flight: &mut S) -> Drain<S::Item>
where
    S: Stream + Unpin,
{
    let next = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Ok(next) => next,
            Err(_) => return Drain::Deadline,
        },
        None => in_flight.next().await,
    };
    match next {
        Some(finished) => Drain::Finished(finished),
        None => Drain::Done,
    }
}

/// Checkpointed as subtasks complete, index-aligned with the leaves
#[derive(Debug, Serialize, Deserialize)]
struct HierarchyState {
    results: Vec<Option<StepRecord>>,
}

/// Fans leaf subtasks out to the agent
pub struct HierarchicalCoordinator {
    ctx: Arc<ReliabilityContext>,
    fallback: FallbackHandler,
}

impl HierarchicalCoordinator {
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
        let tree = TaskTree::from_tasks(&tasks);
        let leaves: Vec<Task> = tree
            .leaves()
            .iter()
            .filter_map(|id| tree.index_of(id))
            .map(|index| tasks[index].clone())
            .collect();

        let mut session =
            WorkflowSession::start(&self.ctx, workflow_id, Pattern::Hierarchical, leaves.len());
        let agent = AgentHandle::new(caller, Arc::clone(&self.ctx));
        let config = self.ctx.config();

        let mut results: Vec<Option<StepRecord>> = vec![None; leaves.len()];
        if let Some((_, state)) = session.resume::<HierarchyState>().await {
            if state.results.len() == leaves.len() {
                for (slot, record) in results.iter_mut().zip(state.results) {
                    // Escalated subtasks have no answer yet and run again
                    *slot = record.filter(|r| r.is_ok() && !r.escalated);
                }
            } else {
                warn!(workflow_id, "Checkpoint does not match the task tree, starting fresh");
            }
        }

        let pending: Vec<usize> = (0..leaves.len()).filter(|&i| results[i].is_none()).collect();
        let mut successes = results.iter().flatten().filter(|r| r.is_ok()).count();
        let mut completed = leaves.len() - pending.len();
        info!(
            subtasks = leaves.len(),
            pending = pending.len(),
            concurrency_limit = config.concurrency_limit,
            "Dispatching subtasks"
        );

        let deadline = config.workflow_timeout().map(|t| Instant::now() + t);
        let mut early_stop = None;
        {
            let agent = &agent;
            let fallback = &self.fallback;
            let leaves = &leaves;
            let mut in_flight = stream::iter(pending.into_iter().map(move |index| async move {
                let task = &leaves[index];
                let step = format!("subtask:{}", task.id);
                let outcome = dispatch(agent, fallback, workflow_id, &step, task).await;
                (index, step, outcome)
            }))
            .buffer_unordered(config.concurrency_limit);

            // Checkpoint writes run alongside the subtasks. At most one write
            // is in flight; completions that land meanwhile are folded into
            // the next one.
            let session = &session;
            let save = move |completed: usize, step: String, state: HierarchyState| {
                async move { session.checkpoint(completed, &step, &state).await }.boxed()
            };
            let mut saving: Option<BoxFuture<'_, ()>> = None;
            let mut unsaved: Option<(usize, String)> = None;

            loop {
                if config.quorum.is_some_and(|quorum| successes >= quorum) {
                    early_stop = Some(EarlyStop::Quorum);
                    break;
                }

                let event = match saving.as_mut() {
                    Some(write) => tokio::select! {
                        _ = write => Drain::Saved,
                        event = next_before(deadline, &mut in_flight) => event,
                    },
                    None => next_before(deadline, &mut in_flight).await,
                };

                let (index, step, outcome) = match event {
                    Drain::Saved => {
                        saving = unsaved.take().map(|(completed, step)| {
                            save(completed, step, HierarchyState { results: results.clone() })
                        });
                        continue;
                    }
                    Drain::Deadline => {
                        early_stop = Some(EarlyStop::Deadline);
                        break;
                    }
                    Drain::Done => break,
                    Drain::Finished(finished) => finished,
                };

                if outcome.is_ok() {
                    successes += 1;
                }
                completed += 1;
                debug!(step = %step, ok = outcome.is_ok(), completed, "Subtask finished");

                results[index] = Some(StepRecord::new(&step, Some(leaves[index].id.clone()), outcome));
                if saving.is_some() {
                    unsaved = Some((completed, step));
                } else {
                    saving = Some(save(completed, step, HierarchyState { results: results.clone() }));
                }
            }
            // Dropping the stream cancels whatever is still in flight

            if let Some(write) = saving.take() {
                write.await;
            }
            if let Some((completed, step)) = unsaved.take() {
                save(completed, step, HierarchyState { results: results.clone() }).await;
            }
        }

        let mut failed = 0;
        let mut output = Vec::with_capacity(leaves.len());
        for (task, slot) in leaves.iter().zip(results) {
            let record = slot.unwrap_or_else(|| {
                let step = format!("subtask:{}", task.id);
                let failure = match early_stop {
                    Some(EarlyStop::Quorum) => AgentFailure::cancelled("quorum reached"),
                    _ => AgentFailure::timeout("workflow deadline elapsed"),
                };
                StepRecord {
                    step,
                    task_id: Some(task.id.clone()),
                    result: Err(failure),
                    fallback: None,
                    escalated: false,
                }
            });
            match &record.result {
                Ok(value) => output.push(value.clone()),
                Err(failure) => {
                    if failure.kind != FailureKind::Cancelled {
                        failed += 1;
                    }
                    output.push(Value::Null);
                }
            }
            session.record(record);
        }

        let status = if failed == 0 {
            WorkflowStatus::Succeeded
        } else if successes == 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::PartialFailure
        };
        if let Some(reason) = early_stop {
            info!(?reason, successes, failed, "Subtask dispatch stopped early");
        }

        session.finish(status, Some(Value::Array(output)), None)
    }
}
