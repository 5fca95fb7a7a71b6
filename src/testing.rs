//! Scripted agent double for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::AgentFailure;
use crate::task::{AgentCaller, AgentResult, Task};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Succeed(Value),
    Fail(AgentFailure),
    Panic(String),
    /// `{"task": id, "input": input}`
    Echo,
}

/// Plays back queued outcomes; per-task scripts win over the shared queue,
/// and an exhausted script falls back to the repeat step.
pub(crate) struct ScriptedCaller {
    target: String,
    shared: Mutex<VecDeque<Step>>,
    per_task: Mutex<HashMap<String, VecDeque<Step>>>,
    repeat: Step,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Task>>,
}

impl ScriptedCaller {
    pub(crate) fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            shared: Mutex::new(VecDeque::new()),
            per_task: Mutex::new(HashMap::new()),
            repeat: Step::Echo,
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeed(self, value: Value) -> Self {
        self.shared.lock().push_back(Step::Succeed(value));
        self
    }

    pub(crate) fn fail(self, failure: AgentFailure) -> Self {
        self.shared.lock().push_back(Step::Fail(failure));
        self
    }

    pub(crate) fn panic_with(self, message: &str) -> Self {
        self.shared.lock().push_back(Step::Panic(message.to_string()));
        self
    }

    pub(crate) fn fail_always(mut self, failure: AgentFailure) -> Self {
        self.repeat = Step::Fail(failure);
        self
    }

    pub(crate) fn repeat(mut self, step: Step) -> Self {
        self.repeat = step;
        self
    }

    pub(crate) fn script(self, task_id: &str, step: Step) -> Self {
        self.per_task
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> Vec<Task> {
        self.seen.lock().clone()
    }

    fn next_step(&self, task: &Task) -> Step {
        if let Some(step) = self
            .per_task
            .lock()
            .get_mut(task.id.as_str())
            .and_then(|queue| queue.pop_front())
        {
            return step;
        }
        self.shared
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl AgentCaller for ScriptedCaller {
    async fn call(&self, task: &Task) -> AgentResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(task.clone());
        let step = self.next_step(task);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            Step::Succeed(value) => Ok(value),
            Step::Fail(failure) => Err(failure),
            Step::Panic(message) => panic!("{}", message),
            Step::Echo => Ok(json!({ "task": task.id, "input": task.input })),
        }
    }

    fn target(&self) -> &str {
        &self.target
    }
}
