//! Tasks and the agent calling contract

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AgentFailure;

/// Outcome of one agent call
pub type AgentResult = Result<Value, AgentFailure>;

/// Stable task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of work for an agent
///
/// Tasks are never mutated after dispatch. Feeding a previous step's output
/// forward goes through [`Task::with_input`], which returns a derived copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Opaque payload handed to the agent
    pub payload: Value,
    /// Output of the preceding step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
}

impl Task {
    pub fn new(payload: Value) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            input: None,
            parent: None,
        }
    }

    pub fn with_id(id: impl Into<TaskId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            input: None,
            parent: None,
        }
    }

    /// Attach this task under `parent` for hierarchical decomposition
    pub fn child_of(mut self, parent: &TaskId) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Derived task carrying `input`
    pub fn with_input(&self, input: Value) -> Self {
        Self {
            input: Some(input),
            ..self.clone()
        }
    }
}

/// An external worker that executes tasks
///
/// Implementations should report failures as [`AgentFailure`] values. The
/// crate still wraps every call in the isolation boundary, so a panic inside
/// `call` surfaces as a permanent failure instead of unwinding through the
/// orchestrator.
#[async_trait]
pub trait AgentCaller: Send + Sync {
    async fn call(&self, task: &Task) -> AgentResult;

    /// Logical target used to select a circuit breaker
    fn target(&self) -> &str {
        "default"
    }
}
