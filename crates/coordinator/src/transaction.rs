//! Commit/rollback handle for a prepared operation

use crate::error::{ClientError, Result};
use proven_common::OperationId;
use proven_protocol::{Connection, Decision, ManagementRequest, ResponseSink};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-operation sending side of an exchange
///
/// Every request of the operation shares one response sink, so the
/// exchange task sees a single ordered stream of responses.
pub(crate) struct Exchange {
    op_id: OperationId,
    connection: Connection,
    sink: ResponseSink,
    decision_sent: AtomicBool,
    cancel_sent: AtomicBool,
}

impl Exchange {
    pub(crate) fn new(op_id: OperationId, connection: Connection, sink: ResponseSink) -> Self {
        Self {
            op_id,
            connection,
            sink,
            decision_sent: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn op_id(&self) -> OperationId {
        self.op_id
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn sink(&self) -> &ResponseSink {
        &self.sink
    }

    /// Send the commit/rollback decision; only the first call sends
    pub(crate) fn decide(&self, decision: Decision) -> Result<()> {
        if self.decision_sent.swap(true, Ordering::SeqCst) {
            return Err(ClientError::DecisionAlreadySent(self.op_id));
        }
        self.send_complete(decision)
    }

    /// Ask the controller to roll back; sends at most once
    ///
    /// Unlike `decide` this also fires after a decision was sent, which lets
    /// a caller nudge an operation whose completion appears stuck.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancel_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.decision_sent.store(true, Ordering::SeqCst);
        if let Err(e) = self.send_complete(Decision::Rollback) {
            tracing::warn!("Failed to send cancellation for operation {}: {}", self.op_id, e);
        }
        true
    }

    fn send_complete(&self, decision: Decision) -> Result<()> {
        tracing::debug!(
            "Sending {} for operation {}",
            decision.as_str(),
            self.op_id
        );
        self.connection.request_with_sink(
            self.op_id,
            ManagementRequest::Complete { decision },
            self.sink.clone(),
        )?;
        Ok(())
    }
}

/// Handed to `OperationListener::operation_prepared`
///
/// The controller holds the operation open until one of `commit` or
/// `rollback` is called. Only the first decision is sent.
#[derive(Clone)]
pub struct PreparedTransaction {
    exchange: Arc<Exchange>,
}

impl PreparedTransaction {
    pub(crate) fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }

    pub fn id(&self) -> OperationId {
        self.exchange.op_id()
    }

    pub fn commit(&self) -> Result<()> {
        self.exchange.decide(Decision::Commit)
    }

    pub fn rollback(&self) -> Result<()> {
        self.exchange.decide(Decision::Rollback)
    }
}

impl std::fmt::Debug for PreparedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTransaction")
            .field("op_id", &self.exchange.op_id())
            .finish()
    }
}
