//! Workflow configuration
//!
//! A single [`WorkflowConfig`] value carries every tunable the reliability and
//! orchestration layers need. It is usually loaded from TOML:
//!
//! ```toml
//! concurrency_limit = 4
//! max_iterations = 5
//! checkpoint_dir = "${HOME}/.warband/checkpoints"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 200
//!
//! [breaker]
//! failure_threshold = 5
//! window_ms = 60000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::WarbandError;

/// Backoff parameters for [`crate::retry::RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Thresholds for [`crate::breaker::CircuitBreaker`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Qualifying failures inside the window that open the circuit
    pub failure_threshold: u32,
    pub window_ms: u64,
    /// Initial open duration
    pub cooldown_ms: u64,
    /// Upper bound for the doubled cool-down after failed trials
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Top-level configuration handed to every orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum sibling calls in flight for fan-out patterns
    pub concurrency_limit: usize,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Directory for file-backed checkpoints; in-memory when unset
    pub checkpoint_dir: Option<PathBuf>,
    /// Iteration cap for iterative refinement
    pub max_iterations: u32,
    /// Upper bound on state machine transitions per run
    pub max_transitions: u32,
    /// Successful results required before fan-out patterns aggregate
    pub quorum: Option<usize>,
    /// Deadline for a whole workflow invocation
    pub workflow_timeout_ms: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            checkpoint_dir: None,
            max_iterations: 5,
            max_transitions: 64,
            quorum: None,
            workflow_timeout_ms: None,
        }
    }
}

impl WorkflowConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, WarbandError> {
        let content = fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn load_str(content: &str) -> Result<Self, WarbandError> {
        let expanded = expand_env_vars(content)?;
        let config: WorkflowConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.workflow_timeout_ms.map(Duration::from_millis)
    }

    /// Reject values that would make the reliability layer misbehave
    pub fn validate(&self) -> Result<(), WarbandError> {
        if self.concurrency_limit == 0 {
            return Err(WarbandError::Config("concurrency_limit must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(WarbandError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(WarbandError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(WarbandError::Config("retry.jitter must be within [0, 1]".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(WarbandError::Config(
                "retry.max_delay_ms must be >= retry.base_delay_ms".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(WarbandError::Config("breaker.failure_threshold must be at least 1".into()));
        }
        if self.breaker.max_cooldown_ms < self.breaker.cooldown_ms {
            return Err(WarbandError::Config(
                "breaker.max_cooldown_ms must be >= breaker.cooldown_ms".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(WarbandError::Config("max_iterations must be at least 1".into()));
        }
        if self.max_transitions == 0 {
            return Err(WarbandError::Config("max_transitions must be at least 1".into()));
        }
        if self.quorum == Some(0) {
            return Err(WarbandError::Config("quorum must be at least 1 when set".into()));
        }
        Ok(())
    }
}

/// Expand `${VAR}` references from the process environment
fn expand_env_vars(content: &str) -> Result<String, WarbandError> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| WarbandError::Config(e.to_string()))?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| WarbandError::EnvVarNotSet(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
