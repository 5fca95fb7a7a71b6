//! Failure taxonomy and crate error types
//!
//! Two families live here. [`AgentFailure`] is the controlled vocabulary every
//! agent call resolves to; it is a value that flows through retries, breakers
//! and orchestrators. [`WarbandError`] and [`CheckpointError`] are ordinary
//! errors for configuration and storage problems that are not part of a
//! workflow's step trail.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Timeouts, rate limits, 5xx-style errors. Worth retrying.
    Transient,
    /// Validation or schema violations, auth, malformed input.
    Permanent,
    /// Rejected by an open circuit breaker without calling the agent.
    CircuitOpen,
    /// Retry budget used up.
    Exhausted,
    /// Every strategy of a fallback chain failed.
    AllFallbacksExhausted,
    /// State machine handler asked for an edge that is not in the table.
    IllegalTransition,
    /// Iteration cap reached without convergence.
    ConvergenceFailed,
    /// Workflow deadline fired before the task completed.
    Timeout,
    /// Task was dropped because the workflow no longer needed it.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::CircuitOpen => "circuit-open",
            FailureKind::Exhausted => "exhausted",
            FailureKind::AllFallbacksExhausted => "all-fallbacks-exhausted",
            FailureKind::IllegalTransition => "illegal-transition",
            FailureKind::ConvergenceFailed => "convergence-failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed agent call, as seen by every layer above the isolation boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Drives every retry and circuit decision
    pub retryable: bool,
    /// Attempts spent before this failure was produced
    #[serde(default)]
    pub attempts: u32,
    /// Underlying failures (last attempt, fallback chain members)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<AgentFailure>,
}

impl AgentFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            attempts: 0,
            causes: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message, true)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message, false)
    }

    pub fn circuit_open(target: &str, retry_after: Duration) -> Self {
        Self::new(
            FailureKind::CircuitOpen,
            format!(
                "circuit for '{}' is open, retry after {}ms",
                target,
                retry_after.as_millis()
            ),
            false,
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message, false)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message, false)
    }

    pub fn illegal_transition(from: &str, to: &str) -> Self {
        Self::new(
            FailureKind::IllegalTransition,
            format!("transition '{}' -> '{}' is not in the transition table", from, to),
            false,
        )
    }

    pub fn convergence_failed(iterations: u32) -> Self {
        let mut failure = Self::new(
            FailureKind::ConvergenceFailed,
            format!("no convergence after {} iterations", iterations),
            false,
        );
        failure.attempts = iterations;
        failure
    }

    /// Wrap the last failure of a retry loop
    pub fn exhausted(last: AgentFailure, attempts: u32) -> Self {
        Self {
            kind: FailureKind::Exhausted,
            message: format!("gave up after {} attempts: {}", attempts, last.message),
            retryable: false,
            attempts,
            causes: vec![last],
        }
    }

    pub fn all_fallbacks_exhausted(causes: Vec<AgentFailure>) -> Self {
        let summary = causes
            .iter()
            .map(|c| c.kind.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            kind: FailureKind::AllFallbacksExhausted,
            message: format!("all {} strategies failed [{}]", causes.len(), summary),
            retryable: false,
            attempts: causes.len() as u32,
            causes,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether this failure says something about the health of the target
    pub fn trips_circuit(&self) -> bool {
        self.retryable
    }

    /// Deepest first cause, following `causes[0]`
    pub fn root_cause(&self) -> &AgentFailure {
        let mut current = self;
        while let Some(next) = current.causes.first() {
            current = next;
        }
        current
    }
}

/// Storage errors raised by checkpoint backends
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored blob does not belong to the requested workflow
    #[error("Invalid checkpoint data: {0}")]
    InvalidData(String),
}

/// Errors that can occur while configuring or building workflows
#[derive(Debug, Error)]
pub enum WarbandError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// `${VAR}` reference to an unset variable
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// State referenced by a state machine definition does not exist
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// Checkpoint backend error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
