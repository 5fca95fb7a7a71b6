//! Shared reliability context
//!
//! Everything that outlives a single call (breaker state, audit trail,
//! checkpoint store, retry counters) hangs off one [`ReliabilityContext`]
//! that the embedding process builds and hands to each orchestrator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditLogger;
use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::WorkflowConfig;
use crate::error::WarbandError;
use crate::retry::{RetryMetrics, RetryPolicy, RetryStats};

/// Read-only monitoring view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilitySnapshot {
    pub taken_at: DateTime<Utc>,
    pub breakers: Vec<BreakerSnapshot>,
    pub retries: RetryStats,
}

pub struct ReliabilityContext {
    config: WorkflowConfig,
    audit: Arc<AuditLogger>,
    breakers: BreakerRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    retry_metrics: Arc<RetryMetrics>,
}

impl ReliabilityContext {
    /// Context with an in-memory checkpoint store and a sink-less audit logger
    pub fn new(config: WorkflowConfig) -> Result<Arc<Self>, WarbandError> {
        ContextBuilder::new(config).build()
    }

    pub fn builder(config: WorkflowConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// Context whose checkpoint backend follows `config.checkpoint_dir`
    pub async fn from_config(config: WorkflowConfig) -> Result<Arc<Self>, WarbandError> {
        let mut builder = ContextBuilder::new(config.clone());
        if let Some(dir) = &config.checkpoint_dir {
            let store = FileCheckpointStore::new(dir.clone()).await?;
            builder = builder.checkpoint_store(Arc::new(store));
        }
        builder.build()
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Retry policy wired to this context's audit logger and counters
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry.clone(), Arc::clone(&self.audit))
            .with_metrics(Arc::clone(&self.retry_metrics))
    }

    pub fn snapshot(&self) -> ReliabilitySnapshot {
        ReliabilitySnapshot {
            taken_at: Utc::now(),
            breakers: self.breakers.snapshot(),
            retries: self.retry_metrics.snapshot(),
        }
    }
}

/// Builder for [`ReliabilityContext`]
pub struct ContextBuilder {
    config: WorkflowConfig,
    audit: Option<Arc<AuditLogger>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl ContextBuilder {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            audit: None,
            checkpoints: None,
        }
    }

    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<ReliabilityContext>, WarbandError> {
        self.config.validate()?;

        let audit = self.audit.unwrap_or_else(|| Arc::new(AuditLogger::new()));
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new()));
        let breakers = BreakerRegistry::new(self.config.breaker.clone(), Arc::clone(&audit));

        info!(
            concurrency_limit = self.config.concurrency_limit,
            max_attempts = self.config.retry.max_attempts,
            failure_threshold = self.config.breaker.failure_threshold,
            "Reliability context ready"
        );

        Ok(Arc::new(ReliabilityContext {
            config: self.config,
            audit,
            breakers,
            checkpoints,
            retry_metrics: Arc::new(RetryMetrics::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::error::AgentFailure;
    use serde_json::json;

    #[test]
    fn test_rejects_invalid_config() {
        let config = WorkflowConfig {
            concurrency_limit: 0,
            ..WorkflowConfig::default()
        };
        assert!(matches!(ReliabilityContext::new(config), Err(WarbandError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_uses_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkflowConfig {
            checkpoint_dir: Some(dir.path().join("ckpt")),
            ..WorkflowConfig::default()
        };
        let ctx = ReliabilityContext::from_config(config).await.unwrap();

        let checkpoint = crate::checkpoint::Checkpoint::new("wf", 0, "s", json!(1));
        ctx.checkpoints().save(&checkpoint).await.unwrap();
        assert!(dir.path().join("ckpt").join("wf.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_breakers_and_retries() {
        let mut config = WorkflowConfig::default();
        config.breaker.failure_threshold = 1;
        config.retry.max_attempts = 1;
        let ctx = ReliabilityContext::new(config).unwrap();

        let policy = ctx.retry_policy();
        policy
            .execute("wf", "s", |_| {
                ctx.breakers()
                    .guard("llm", "wf", "s", || async { Err(AgentFailure::transient("503")) })
            })
            .await
            .unwrap_err();

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.retries.attempts, 1);
        assert_eq!(snapshot.retries.exhausted, 1);
        assert_eq!(snapshot.breakers.len(), 1);
        assert_eq!(snapshot.breakers[0].state, CircuitState::Open);
    }
}
