//! Live audit event streaming
//!
//! [`AuditChannel`] is an [`AuditSink`] that forwards every recorded event to
//! an [`AuditSubscriber`], e.g. a monitoring task or a UI bridge.

use tokio::sync::mpsc;

use crate::audit::{AuditEvent, AuditSink};

enum Sender {
    Unbounded(mpsc::UnboundedSender<AuditEvent>),
    Bounded(mpsc::Sender<AuditEvent>),
}

enum Receiver {
    Unbounded(mpsc::UnboundedReceiver<AuditEvent>),
    Bounded(mpsc::Receiver<AuditEvent>),
}

/// Sink side of an audit stream
pub struct AuditChannel {
    tx: Sender,
    /// Only forward events of this workflow
    workflow_filter: Option<String>,
}

/// Receiving side of an audit stream
pub struct AuditSubscriber {
    rx: Receiver,
}

impl AuditChannel {
    /// Create an unbounded channel pair
    pub fn new() -> (Self, AuditSubscriber) {
        ChannelBuilder::new().build()
    }

    /// Check if the subscriber has gone away
    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Sender::Unbounded(tx) => tx.is_closed(),
            Sender::Bounded(tx) => tx.is_closed(),
        }
    }
}

impl AuditSink for AuditChannel {
    fn write(&self, event: &AuditEvent) -> anyhow::Result<()> {
        if let Some(filter) = &self.workflow_filter {
            if filter != &event.workflow_id {
                return Ok(());
            }
        }

        match &self.tx {
            Sender::Unbounded(tx) => tx
                .send(event.clone())
                .map_err(|_| ChannelError::Closed)?,
            Sender::Bounded(tx) => tx.try_send(event.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Lagging,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })?,
        }
        Ok(())
    }
}

impl AuditSubscriber {
    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<AuditEvent> {
        match &mut self.rx {
            Receiver::Unbounded(rx) => rx.try_recv().ok(),
            Receiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Wait for the next event; `None` once every sender is dropped
    pub async fn recv(&mut self) -> Option<AuditEvent> {
        match &mut self.rx {
            Receiver::Unbounded(rx) => rx.recv().await,
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Audit subscriber is closed")]
    Closed,

    #[error("Audit subscriber is not keeping up")]
    Lagging,
}

/// Builder for configured audit channels
pub struct ChannelBuilder {
    buffer_size: Option<usize>,
    workflow_filter: Option<String>,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self {
            buffer_size: None,
            workflow_filter: None,
        }
    }

    /// Bounded buffer; events are dropped (and the drop logged) when full
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size.max(1));
        self
    }

    /// Only stream events of one workflow
    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_filter = Some(workflow_id.into());
        self
    }

    /// Build the channel pair
    pub fn build(self) -> (AuditChannel, AuditSubscriber) {
        let (tx, rx) = match self.buffer_size {
            Some(size) => {
                let (tx, rx) = mpsc::channel(size);
                (Sender::Bounded(tx), Receiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sender::Unbounded(tx), Receiver::Unbounded(rx))
            }
        };

        (
            AuditChannel {
                tx,
                workflow_filter: self.workflow_filter,
            },
            AuditSubscriber { rx },
        )
    }
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
