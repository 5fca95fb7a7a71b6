//! Append-only audit trail
//!
//! Every decision point (attempt, breaker rejection, fallback, checkpoint,
//! transition) is recorded as an [`AuditEvent`]. The logger keeps an in-memory
//! trail per workflow and forwards each event to any number of sinks. Recording
//! never fails from the caller's point of view.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// What happened at a decision point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    WorkflowStarted,
    Resumed,
    Attempt,
    Success,
    Failure,
    CircuitOpen,
    CircuitClosed,
    FallbackUsed,
    Escalation,
    Checkpoint,
    Transition,
    WorkflowFinished,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Global append order, assigned by the logger
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub step: String,
    pub kind: AuditKind,
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(
        workflow_id: impl Into<String>,
        step: impl Into<String>,
        kind: AuditKind,
        detail: Value,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            step: step.into(),
            kind,
            detail,
        }
    }
}

/// Destination for audit events (file, log pipeline, observability system)
pub trait AuditSink: Send + Sync {
    fn write(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Trail {
    next_seq: u64,
    by_workflow: HashMap<String, Vec<AuditEvent>>,
    /// Workflow ids in the order their trails were opened
    opened: VecDeque<String>,
}

impl Trail {
    fn remove(&mut self, workflow_id: &str) -> Option<Vec<AuditEvent>> {
        let events = self.by_workflow.remove(workflow_id)?;
        self.opened.retain(|id| id != workflow_id);
        Some(events)
    }
}

/// Audit logger shared by every component of a [`crate::ReliabilityContext`]
///
/// Sinks see every event. The in-memory trails are kept until
/// [`AuditLogger::forget`] drops them, or, with
/// [`AuditLogger::with_retention`], until newer workflows push them out.
pub struct AuditLogger {
    trail: Mutex<Trail>,
    sinks: Vec<Arc<dyn AuditSink>>,
    max_workflows: Option<usize>,
}

impl AuditLogger {
    /// Logger that only keeps the in-memory trail
    pub fn new() -> Self {
        Self {
            trail: Mutex::new(Trail::default()),
            sinks: Vec::new(),
            max_workflows: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Keep the trails of at most `max_workflows` workflows, dropping the
    /// oldest first
    pub fn with_retention(mut self, max_workflows: usize) -> Self {
        self.max_workflows = Some(max_workflows.max(1));
        self
    }

    /// Append an event
    ///
    /// The trail lock is held while sinks run, so sinks observe events of a
    /// workflow in append order.
    pub fn record(&self, mut event: AuditEvent) {
        let mut trail = self.trail.lock();
        event.seq = trail.next_seq;
        trail.next_seq += 1;

        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.write(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(workflow_id = %event.workflow_id, error = %e, "Audit sink write failed");
                }
                Err(_) => {
                    warn!(workflow_id = %event.workflow_id, "Audit sink panicked");
                }
            }
        }

        if !trail.by_workflow.contains_key(&event.workflow_id) {
            if let Some(max) = self.max_workflows {
                while trail.opened.len() >= max {
                    let Some(oldest) = trail.opened.pop_front() else { break };
                    trail.by_workflow.remove(&oldest);
                    debug!(workflow_id = %oldest, "Audit trail evicted");
                }
            }
            trail.opened.push_back(event.workflow_id.clone());
        }
        trail
            .by_workflow
            .entry(event.workflow_id.clone())
            .or_default()
            .push(event);
    }

    /// Drop the in-memory trail of a finished workflow, returning it
    pub fn forget(&self, workflow_id: &str) -> Vec<AuditEvent> {
        self.trail.lock().remove(workflow_id).unwrap_or_default()
    }

    /// Number of workflows with an in-memory trail
    pub fn tracked(&self) -> usize {
        self.trail.lock().by_workflow.len()
    }

    /// Shorthand for [`AuditLogger::record`]
    pub fn emit(&self, workflow_id: &str, step: &str, kind: AuditKind, detail: Value) {
        self.record(AuditEvent::new(workflow_id, step, kind, detail));
    }

    /// All events recorded for a workflow, in append order
    pub fn trail(&self, workflow_id: &str) -> Vec<AuditEvent> {
        self.trail
            .lock()
            .by_workflow
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of events recorded for a workflow
    pub fn count(&self, workflow_id: &str) -> usize {
        self.trail
            .lock()
            .by_workflow
            .get(workflow_id)
            .map_or(0, Vec::len)
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends events as JSON lines to a file
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonLinesSink {
    fn write(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.lock().write_all(&line)?;
        Ok(())
    }
}

/// Mirrors audit events into `tracing`
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn write(&self, event: &AuditEvent) -> anyhow::Result<()> {
        info!(
            target: "warband::audit",
            seq = event.seq,
            workflow_id = %event.workflow_id,
            step = %event.step,
            kind = ?event.kind,
            detail = %event.detail,
            "audit"
        );
        Ok(())
    }
}
