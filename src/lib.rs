//! # Warband
//!
//! Reliable multi-agent workflows - the band that keeps marching when some of
//! its members fall.
//!
//! This crate coordinates calls to unreliable, slow, non-deterministic agents
//! (LLM-backed workers) into workflows that survive partial failure, resume
//! from checkpoints and leave an audit trail of every decision.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────┐ ┌────────────┐ ┌─────────┐ ┌─────────────┐ ┌────────┐ │
//! │  │Sequential│ │Hierarchical│ │Iterative│ │StateMachine │ │ Voting │ │
//! │  └──────────┘ └────────────┘ └─────────┘ └─────────────┘ └────────┘ │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │  WorkflowSession (steps, checkpoints)
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │ AgentHandle │     │  Fallback   │     │ Checkpoint  │
//!   │             │     │   chain     │     │   store     │
//!   └──────┬──────┘     └─────────────┘     └─────────────┘
//!          │
//!     isolate ─▶ retry ─▶ breaker ─▶ isolate ─▶ AgentCaller
//!          │
//!          └──────────────▶ AuditLogger ─▶ sinks (file, tracing, channel)
//! ```
//!
//! ## Key Concepts
//!
//! - **AgentCaller**: the external worker; returns a value or an [`AgentFailure`]
//! - **ReliabilityContext**: shared breakers, audit log, checkpoints and counters
//! - **Orchestrator**: one of five workflow patterns behind a single `run`
//! - **WorkflowResult**: terminal status, per-step trail and audit trail

pub mod agent;
pub mod audit;
pub mod breaker;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod hierarchy;
pub mod isolation;
pub mod iterative;
pub mod orchestrator;
pub mod retry;
pub mod sequential;
pub mod session;
pub mod state_machine;
pub mod task;
pub mod validate;
pub mod voting;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::AgentHandle;
pub use audit::{AuditEvent, AuditKind, AuditLogger, AuditSink, JsonLinesSink, TracingSink};
pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use channel::{AuditChannel, AuditSubscriber, ChannelBuilder};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{BreakerConfig, RetryConfig, WorkflowConfig};
pub use context::{ContextBuilder, ReliabilityContext, ReliabilitySnapshot};
pub use error::{AgentFailure, CheckpointError, FailureKind, WarbandError};
pub use fallback::{
    AgentStrategy, CachedAnswer, EscalateToHuman, FallbackHandler, FallbackStrategy,
    FallbackSuccess,
};
pub use hierarchy::{HierarchicalCoordinator, TaskTree};
pub use isolation::{isolate, isolate_fallible};
pub use iterative::{Assessment, Convergence, IterativeRefiner, ScoreThreshold};
pub use orchestrator::{Orchestrator, Pattern, WorkflowResult, WorkflowStatus};
pub use retry::{RetryMetrics, RetryPolicy, RetryStats};
pub use sequential::SequentialPipeline;
pub use session::{StepOutcome, StepRecord, WorkflowSession};
pub use state_machine::{
    AgentStateHandler, StateContext, StateHandler, StateMachine, StateMachineBuilder, Transition,
    TransitionTable,
};
pub use task::{AgentCaller, AgentResult, Task, TaskId};
pub use validate::{Schema, Validator};
pub use voting::{tally, Grouping, TieBreak, Tally, Verdict, VotingEnsemble};
