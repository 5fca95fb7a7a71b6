//! Explicit state machine workflows
//!
//! States are named; a [`TransitionTable`] lists the allowed edges. Each
//! state's [`StateHandler`] decides where to go next, and the machine refuses
//! any edge the table does not contain.
//!
//! ```text
//!   draft ──▶ review ──▶ published
//!     ▲          │
//!     └──────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentHandle;
use crate::audit::AuditKind;
use crate::context::ReliabilityContext;
use crate::error::{AgentFailure, WarbandError};
use crate::fallback::{FallbackHandler, FallbackStrategy};
use crate::isolation::isolate;
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::session::{StepOutcome, StepRecord, WorkflowSession};
use crate::task::{AgentCaller, Task, TaskId};
use crate::validate::extract_json;

/// What a handler wants to happen after its state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Next { state: String, data: Value },
    Finish(Value),
}

/// Allowed edges between named states
///
/// A state without outgoing edges is terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionTable {
    edges: BTreeMap<String, Vec<String>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self, state: &str) {
        self.edges.entry(state.to_string()).or_default();
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_state(to);
        let targets = self.edges.entry(from.to_string()).or_default();
        if !targets.iter().any(|t| t == to) {
            targets.push(to.to_string());
        }
    }

    pub fn contains(&self, state: &str) -> bool {
        self.edges.contains_key(state)
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.targets(from).iter().any(|t| t == to)
    }

    pub fn targets(&self, state: &str) -> &[String] {
        self.edges.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.contains(state) && self.targets(state).is_empty()
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }
}

/// What a handler can see while it runs
pub struct StateContext<'a> {
    pub workflow_id: &'a str,
    pub state: &'a str,
    /// Audit step name of this state visit
    pub step: &'a str,
    pub agent: &'a AgentHandle,
    /// States completed so far, in order
    pub visited: &'a [String],
}

/// Domain logic of one state
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn handle(&self, cx: &StateContext<'_>, data: &Value) -> Result<Transition, AgentFailure>;
}

#[derive(Debug, Clone)]
enum Route {
    /// Agent output carries `{"next": ..., "data": ...}` or `{"finish": ...}`
    FromOutput,
    Always(String),
    Finish,
}

/// Calls the agent and routes on its output
///
/// The agent receives `{"state", "instructions"}` as payload and the current
/// data as `input`.
pub struct AgentStateHandler {
    instructions: Value,
    route: Route,
}

impl AgentStateHandler {
    pub fn new(instructions: Value) -> Self {
        Self {
            instructions,
            route: Route::FromOutput,
        }
    }

    /// Always continue to `state` with the agent output as data
    pub fn then(mut self, state: impl Into<String>) -> Self {
        self.route = Route::Always(state.into());
        self
    }

    /// The agent output is the final workflow output
    pub fn finishing(mut self) -> Self {
        self.route = Route::Finish;
        self
    }

    fn route_output(&self, output: Value) -> Result<Transition, AgentFailure> {
        match &self.route {
            Route::Always(state) => Ok(Transition::Next {
                state: state.clone(),
                data: output,
            }),
            Route::Finish => Ok(Transition::Finish(output)),
            Route::FromOutput => routing_of(&output).ok_or_else(|| {
                AgentFailure::permanent("agent output names neither a next state nor a finish value")
            }),
        }
    }
}

/// Read `{"next": ..., "data": ...}` or `{"finish": ...}` from an output,
/// looking inside free text when needed
fn routing_of(output: &Value) -> Option<Transition> {
    let document = match output {
        Value::String(text) => extract_json(text).unwrap_or_else(|| output.clone()),
        other => other.clone(),
    };
    if let Some(state) = document.get("next").and_then(Value::as_str) {
        let data = document.get("data").cloned().unwrap_or(Value::Null);
        return Some(Transition::Next {
            state: state.to_string(),
            data,
        });
    }
    document
        .get("finish")
        .map(|result| Transition::Finish(result.clone()))
}

#[async_trait]
impl StateHandler for AgentStateHandler {
    async fn handle(&self, cx: &StateContext<'_>, data: &Value) -> Result<Transition, AgentFailure> {
        let task = Task::new(json!({ "state": cx.state, "instructions": self.instructions }))
            .with_input(data.clone());
        let output = cx.agent.call(cx.workflow_id, cx.step, &task).await?;
        self.route_output(output)
    }
}

/// Checkpointed before each handler runs
#[derive(Debug, Serialize, Deserialize)]
struct MachineState {
    state: String,
    data: Value,
    visited: Vec<String>,
    transitions: u32,
    steps: Vec<StepRecord>,
}

/// Builder for [`StateMachine`]
pub struct StateMachineBuilder {
    ctx: Arc<ReliabilityContext>,
    table: TransitionTable,
    handlers: HashMap<String, Arc<dyn StateHandler>>,
    initial: Option<String>,
    fallback: FallbackHandler,
}

impl StateMachineBuilder {
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    pub fn state(mut self, name: &str, handler: Arc<dyn StateHandler>) -> Self {
        self.table.add_state(name);
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn transition(mut self, from: &str, to: &str) -> Self {
        self.table.add_edge(from, to);
        self
    }

    /// Declare a state with no outgoing edges
    pub fn terminal(mut self, name: &str) -> Self {
        self.table.add_state(name);
        self
    }

    pub fn table(mut self, table: TransitionTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = self.fallback.with_strategy(strategy);
        self
    }

    pub fn build(self) -> Result<StateMachine, WarbandError> {
        let initial = self
            .initial
            .ok_or_else(|| WarbandError::Config("state machine needs an initial state".into()))?;
        if !self.table.contains(&initial) {
            return Err(WarbandError::UnknownState(initial));
        }
        if let Some(name) = self.handlers.keys().find(|name| !self.table.contains(name)) {
            return Err(WarbandError::UnknownState(name.clone()));
        }
        if let Some(name) = self
            .table
            .states()
            .find(|s| !self.table.is_terminal(s) && !self.handlers.contains_key(*s))
        {
            return Err(WarbandError::Config(format!(
                "state '{}' has outgoing transitions but no handler",
                name
            )));
        }

        Ok(StateMachine {
            ctx: self.ctx,
            table: self.table,
            handlers: self.handlers,
            initial,
            fallback: self.fallback,
        })
    }
}

pub struct StateMachine {
    ctx: Arc<ReliabilityContext>,
    table: TransitionTable,
    handlers: HashMap<String, Arc<dyn StateHandler>>,
    initial: String,
    fallback: FallbackHandler,
}

impl StateMachine {
    pub fn builder(ctx: Arc<ReliabilityContext>) -> StateMachineBuilder {
        let fallback = FallbackHandler::new(Arc::clone(ctx.audit()));
        StateMachineBuilder {
            ctx,
            table: TransitionTable::new(),
            handlers: HashMap::new(),
            initial: None,
            fallback,
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Run the machine; the first task's payload is the initial data
    #[instrument(skip(self, tasks, caller), fields(workflow_id = %workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        tasks: Vec<Task>,
        caller: Arc<dyn AgentCaller>,
    ) -> WorkflowResult {
        let mut session =
            WorkflowSession::start(&self.ctx, workflow_id, Pattern::StateMachine, tasks.len());
        let agent = AgentHandle::new(caller, Arc::clone(&self.ctx));
        let max_transitions = self.ctx.config().max_transitions;
        let task_id = tasks.first().map(|t| t.id.clone()).unwrap_or_else(TaskId::new);

        let mut machine = match session.resume::<MachineState>().await {
            Some((_, state)) if self.table.contains(&state.state) => state,
            Some((_, state)) => {
                warn!(state = %state.state, "Checkpointed state is not in the table, starting over");
                self.initial_state(&tasks)
            }
            None => self.initial_state(&tasks),
        };
        session.restore(std::mem::take(&mut machine.steps));

        loop {
            let current = machine.state.clone();
            let step = format!("state:{}", current);
            machine.steps = session.steps().to_vec();
            session.checkpoint(machine.visited.len(), &step, &machine).await;

            let Some(handler) = self.handlers.get(&current) else {
                // Build guarantees only terminal states lack a handler
                info!(state = %current, "Reached terminal state");
                return session.finish(WorkflowStatus::Succeeded, Some(machine.data), None);
            };

            let cx = StateContext {
                workflow_id,
                state: &current,
                step: &step,
                agent: &agent,
                visited: &machine.visited,
            };
            debug!(state = %current, "Running state handler");

            // A fallback answer stands in for the handler's output and is
            // routed through the table like any other
            let (transition, rescued_by) = match isolate(handler.handle(&cx, &machine.data)).await {
                Ok(transition) => (transition, None),
                Err(cause) => {
                    let task = Task::with_id(task_id.clone(), machine.data.clone());
                    match self.fallback.execute(workflow_id, &step, &task, cause).await {
                        Ok(success) if success.escalated => {
                            info!(state = %current, "State handed to a human, stopping");
                            session.record(StepRecord::new(
                                &step,
                                Some(task_id),
                                StepOutcome {
                                    result: Ok(success.value),
                                    fallback: Some(success.strategy),
                                    escalated: true,
                                },
                            ));
                            return session.finish(
                                WorkflowStatus::PartialFailure,
                                Some(machine.data),
                                None,
                            );
                        }
                        Ok(success) => match self.rescue_transition(&current, &success.value) {
                            Some(transition) => (transition, Some(success.strategy)),
                            None => {
                                warn!(
                                    state = %current,
                                    strategy = %success.strategy,
                                    "Fallback answer does not say where to go next"
                                );
                                session.record(StepRecord::new(
                                    &step,
                                    Some(task_id),
                                    StepOutcome {
                                        result: Ok(success.value),
                                        fallback: Some(success.strategy),
                                        escalated: false,
                                    },
                                ));
                                return session.finish(
                                    WorkflowStatus::PartialFailure,
                                    Some(machine.data),
                                    None,
                                );
                            }
                        },
                        Err(failure) => {
                            warn!(state = %current, kind = %failure.kind, "State handler failed");
                            session.record(StepRecord::new(&step, Some(task_id), err(failure)));
                            let status = if machine.visited.is_empty() {
                                WorkflowStatus::Failed
                            } else {
                                WorkflowStatus::PartialFailure
                            };
                            return session.finish(status, Some(machine.data), None);
                        }
                    }
                }
            };

            match transition {
                Transition::Finish(output) if self.table.is_terminal(&current) => {
                    session.record(StepRecord::new(
                        &step,
                        Some(task_id.clone()),
                        ok(output.clone(), rescued_by),
                    ));
                    return session.finish(WorkflowStatus::Succeeded, Some(output), None);
                }
                Transition::Finish(_) => {
                    return self.reject(session, &step, &task_id, &current, "<finish>");
                }
                Transition::Next { state: next, .. } if !self.table.allows(&current, &next) => {
                    return self.reject(session, &step, &task_id, &current, &next);
                }
                Transition::Next { state: next, data } => {
                    self.ctx.audit().emit(
                        workflow_id,
                        &step,
                        AuditKind::Transition,
                        json!({ "from": current, "to": next, "allowed": true }),
                    );
                    session.record(StepRecord::new(
                        &step,
                        Some(task_id.clone()),
                        ok(data.clone(), rescued_by),
                    ));

                    machine.transitions += 1;
                    if machine.transitions > max_transitions {
                        let failure = AgentFailure::permanent(format!(
                            "transition budget of {} exhausted",
                            max_transitions
                        ));
                        warn!(max_transitions, "State machine exceeded its transition budget");
                        session.record(StepRecord::new(&step, Some(task_id.clone()), err(failure)));
                        return session.finish(WorkflowStatus::Failed, Some(data), None);
                    }

                    machine.visited.push(current);
                    machine.state = next;
                    machine.data = data;
                }
            }
        }
    }

    /// Where a fallback answer for `state` leads
    ///
    /// An explicit `next`/`finish` in the answer wins. Otherwise a terminal
    /// state finishes with it and a state with a single outgoing edge takes
    /// that edge. Anything else is ambiguous.
    fn rescue_transition(&self, state: &str, answer: &Value) -> Option<Transition> {
        if let Some(transition) = routing_of(answer) {
            return Some(transition);
        }
        if self.table.is_terminal(state) {
            return Some(Transition::Finish(answer.clone()));
        }
        match self.table.targets(state) {
            [only] => Some(Transition::Next {
                state: only.clone(),
                data: answer.clone(),
            }),
            _ => None,
        }
    }

    fn initial_state(&self, tasks: &[Task]) -> MachineState {
        MachineState {
            state: self.initial.clone(),
            data: tasks.first().map(|t| t.payload.clone()).unwrap_or(Value::Null),
            visited: Vec::new(),
            transitions: 0,
            steps: Vec::new(),
        }
    }

    /// Refuse an edge; the checkpoint taken before the handler stays in place
    fn reject(
        &self,
        mut session: WorkflowSession,
        step: &str,
        task_id: &TaskId,
        from: &str,
        to: &str,
    ) -> WorkflowResult {
        warn!(from, to, "Illegal transition");
        self.ctx.audit().emit(
            session.workflow_id(),
            step,
            AuditKind::Transition,
            json!({ "from": from, "to": to, "allowed": false }),
        );
        session.record(StepRecord::new(
            step,
            Some(task_id.clone()),
            err(AgentFailure::illegal_transition(from, to)),
        ));
        session.finish(WorkflowStatus::Failed, None, None)
    }
}

fn ok(value: Value, fallback: Option<String>) -> StepOutcome {
    StepOutcome {
        result: Ok(value),
        fallback,
        escalated: false,
    }
}

fn err(failure: AgentFailure) -> StepOutcome {
    StepOutcome {
        result: Err(failure),
        fallback: None,
        escalated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::error::FailureKind;
    use crate::fallback::{CachedAnswer, EscalateToHuman};
    use crate::testing::ScriptedCaller;

    /// Handler that returns a fixed transition
    struct Fixed(Transition);

    #[async_trait]
    impl StateHandler for Fixed {
        async fn handle(&self, _: &StateContext<'_>, _: &Value) -> Result<Transition, AgentFailure> {
            Ok(self.0.clone())
        }
    }

    /// Hands the data on unchanged
    struct Forward(&'static str);

    #[async_trait]
    impl StateHandler for Forward {
        async fn handle(&self, _: &StateContext<'_>, data: &Value) -> Result<Transition, AgentFailure> {
            Ok(Transition::Next {
                state: self.0.into(),
                data: data.clone(),
            })
        }
    }

    /// Counts review rounds in the data and approves on the second
    struct Reviewer;

    #[async_trait]
    impl StateHandler for Reviewer {
        async fn handle(&self, _: &StateContext<'_>, data: &Value) -> Result<Transition, AgentFailure> {
            let rounds = data["rounds"].as_u64().unwrap_or(0) + 1;
            let next = if rounds >= 2 { "published" } else { "draft" };
            Ok(Transition::Next {
                state: next.into(),
                data: json!({ "rounds": rounds }),
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl StateHandler for Failing {
        async fn handle(&self, _: &StateContext<'_>, _: &Value) -> Result<Transition, AgentFailure> {
            Err(AgentFailure::permanent("handler blew up"))
        }
    }

    fn context(max_transitions: u32) -> Arc<ReliabilityContext> {
        let mut config = WorkflowConfig::default();
        config.max_transitions = max_transitions;
        config.retry.max_attempts = 1;
        ReliabilityContext::new(config).unwrap()
    }

    fn pass_through() -> Arc<dyn StateHandler> {
        Arc::new(AgentStateHandler::new(json!("revise")).then("review"))
    }

    fn editorial(ctx: Arc<ReliabilityContext>) -> StateMachine {
        StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Forward("review")))
            .state("review", Arc::new(Reviewer))
            .transition("draft", "review")
            .transition("review", "draft")
            .transition("review", "published")
            .terminal("published")
            .build()
            .unwrap()
    }

    #[test]
    fn test_table() {
        let mut table = TransitionTable::new();
        table.add_edge("a", "b");
        table.add_edge("a", "b");

        assert!(table.allows("a", "b"));
        assert!(!table.allows("b", "a"));
        assert_eq!(table.targets("a").len(), 1);
        assert!(table.is_terminal("b"));
        assert!(!table.is_terminal("a"));
        assert!(!table.is_terminal("missing"));
    }

    #[test]
    fn test_builder_validation() {
        let ctx = context(10);
        let missing_initial = StateMachine::builder(Arc::clone(&ctx)).terminal("done").build();
        assert!(matches!(missing_initial, Err(WarbandError::Config(_))));

        let unknown = StateMachine::builder(Arc::clone(&ctx))
            .initial("nowhere")
            .terminal("done")
            .build();
        assert!(matches!(unknown, Err(WarbandError::UnknownState(s)) if s == "nowhere"));

        let no_handler = StateMachine::builder(ctx)
            .initial("a")
            .transition("a", "b")
            .build();
        assert!(matches!(no_handler, Err(WarbandError::Config(_))));
    }

    #[tokio::test]
    async fn test_cycles_until_terminal() {
        let ctx = context(10);
        let machine = editorial(Arc::clone(&ctx));

        let result = machine
            .run("wf", vec![Task::new(json!({}))], Arc::new(ScriptedCaller::new("llm")))
            .await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.output, Some(json!({"rounds": 2})));
        // draft, review, draft, review
        assert_eq!(result.steps.len(), 4);
        let transitions = result
            .audit_trail
            .iter()
            .filter(|e| e.kind == AuditKind::Transition)
            .count();
        assert_eq!(transitions, 4);
    }

    #[tokio::test]
    async fn test_illegal_transition_keeps_checkpoint() {
        let ctx = context(10);
        let machine = StateMachine::builder(Arc::clone(&ctx))
            .initial("draft")
            .state("draft", Arc::new(Fixed(Transition::Next { state: "review".into(), data: json!("v1") })))
            .state("review", Arc::new(Fixed(Transition::Next { state: "shipped".into(), data: json!("v2") })))
            .transition("draft", "review")
            .transition("review", "published")
            .terminal("published")
            .build()
            .unwrap();

        let result = machine
            .run("wf", vec![Task::new(json!("v0"))], Arc::new(ScriptedCaller::new("llm")))
            .await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        let failure = result.steps.last().unwrap().result.as_ref().unwrap_err();
        assert_eq!(failure.kind, FailureKind::IllegalTransition);

        let checkpoint = ctx.checkpoints().load("wf").await.unwrap().unwrap();
        assert_eq!(checkpoint.state["state"], "review");
        assert_eq!(checkpoint.state["data"], "v1");
        assert_eq!(checkpoint.state["visited"], json!(["draft"]));
    }

    #[tokio::test]
    async fn test_finish_from_non_terminal_is_illegal() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Fixed(Transition::Finish(json!("early")))))
            .transition("draft", "done")
            .terminal("done")
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(
            result.steps[0].result.as_ref().unwrap_err().kind,
            FailureKind::IllegalTransition
        );
    }

    #[tokio::test]
    async fn test_transition_budget() {
        let ctx = context(3);
        let machine = StateMachine::builder(ctx)
            .initial("ping")
            .state("ping", Arc::new(Fixed(Transition::Next { state: "pong".into(), data: json!(null) })))
            .state("pong", Arc::new(Fixed(Transition::Next { state: "ping".into(), data: json!(null) })))
            .transition("ping", "pong")
            .transition("pong", "ping")
            .transition("pong", "end")
            .terminal("end")
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        let failure = result.steps.last().unwrap().result.as_ref().unwrap_err();
        assert!(failure.message.contains("budget"));
    }

    #[tokio::test]
    async fn test_agent_handler_routes_on_output() {
        let ctx = context(10);
        let caller = Arc::new(
            ScriptedCaller::new("llm")
                .succeed(json!("edited text"))
                .succeed(json!("Looks good. {\"next\": \"published\", \"data\": \"final text\"}")),
        );
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", pass_through())
            .state("review", Arc::new(AgentStateHandler::new(json!("approve or send back"))))
            .transition("draft", "review")
            .transition("review", "draft")
            .transition("review", "published")
            .terminal("published")
            .build()
            .unwrap();

        let result = machine.run("wf", vec![Task::new(json!("text"))], caller.clone()).await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.output, Some(json!("final text")));
        assert_eq!(caller.seen()[1].input, Some(json!("edited text")));
        assert_eq!(caller.seen()[0].payload["state"], "draft");
    }

    #[tokio::test]
    async fn test_handler_failure_uses_fallback() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Failing))
            .transition("draft", "done")
            .terminal("done")
            .with_strategy(Arc::new(CachedAnswer::new(json!("template"))))
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.output, Some(json!("template")));
        assert_eq!(result.steps[0].fallback.as_deref(), Some("cached-answer"));
    }

    #[tokio::test]
    async fn test_fallback_answer_follows_the_table() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Failing))
            .state("review", Arc::new(Forward("published")))
            .transition("draft", "review")
            .transition("review", "published")
            .terminal("published")
            .with_strategy(Arc::new(CachedAnswer::new(json!("template"))))
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.output, Some(json!("template")));
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].step, "state:draft");
        assert_eq!(result.steps[0].fallback.as_deref(), Some("cached-answer"));
        assert_eq!(result.steps[1].step, "state:review");
        let transitions = result
            .audit_trail
            .iter()
            .filter(|e| e.kind == AuditKind::Transition)
            .count();
        assert_eq!(transitions, 2);
    }

    #[tokio::test]
    async fn test_fallback_answer_without_route_is_partial() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("triage")
            .state("triage", Arc::new(Failing))
            .transition("triage", "fix")
            .transition("triage", "wontfix")
            .terminal("fix")
            .terminal("wontfix")
            .with_strategy(Arc::new(CachedAnswer::new(json!("template"))))
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::PartialFailure);
        assert_eq!(result.steps.len(), 1);
        assert_ne!(result.output, Some(json!("template")));
    }

    #[tokio::test]
    async fn test_fallback_answer_with_illegal_route_is_rejected() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Failing))
            .transition("draft", "review")
            .terminal("review")
            .with_strategy(Arc::new(CachedAnswer::new(json!({"next": "published", "data": 1}))))
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(
            result.steps[0].result.as_ref().unwrap_err().kind,
            FailureKind::IllegalTransition
        );
    }

    #[tokio::test]
    async fn test_escalation_stops_the_machine() {
        let ctx = context(10);
        let machine = StateMachine::builder(ctx)
            .initial("draft")
            .state("draft", Arc::new(Failing))
            .state("review", Arc::new(Forward("published")))
            .transition("draft", "review")
            .transition("review", "published")
            .terminal("published")
            .with_strategy(Arc::new(EscalateToHuman::new()))
            .build()
            .unwrap();

        let result = machine.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        assert_eq!(result.status, WorkflowStatus::Escalated);
        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].escalated);
    }

    #[tokio::test]
    async fn test_resume_reenters_checkpointed_state() {
        let ctx = context(10);
        let failing = StateMachine::builder(Arc::clone(&ctx))
            .initial("draft")
            .state("draft", Arc::new(Fixed(Transition::Next { state: "review".into(), data: json!("v1") })))
            .state("review", Arc::new(Failing))
            .transition("draft", "review")
            .transition("review", "done")
            .terminal("done")
            .build()
            .unwrap();
        let first = failing.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;
        assert_eq!(first.status, WorkflowStatus::PartialFailure);

        let fixed = StateMachine::builder(Arc::clone(&ctx))
            .initial("draft")
            .state("draft", Arc::new(Failing))
            .state("review", Arc::new(Fixed(Transition::Next { state: "done".into(), data: json!("v2") })))
            .transition("draft", "review")
            .transition("review", "done")
            .terminal("done")
            .build()
            .unwrap();
        let second = fixed.run("wf", vec![], Arc::new(ScriptedCaller::new("llm"))).await;

        // draft is not re-run, so its failing handler never fires
        assert_eq!(second.status, WorkflowStatus::Succeeded);
        assert_eq!(second.output, Some(json!("v2")));
        assert_eq!(second.resumed_from, Some(1));
    }
}
