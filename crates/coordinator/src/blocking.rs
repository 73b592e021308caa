//! Synchronous front end for callers that block until prepare
//!
//! The listener offers the prepared (or failed) result into a single-slot
//! queue; the caller takes it out with a blocking or timed receive.

use crate::client::{ExecuteOptions, ManagementClient};
use crate::error::{ClientError, Result};
use crate::future::OperationFuture;
use crate::listener::OperationListener;
use crate::transaction::PreparedTransaction;
use proven_common::{Envelope, OperationId, OperationOutcome};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::time::Duration;

/// Result of the first phase of an operation
#[derive(Debug)]
pub struct PreparedOperation {
    prepared_result: OperationOutcome,
    transaction: Option<PreparedTransaction>,
    future: OperationFuture,
}

impl PreparedOperation {
    pub fn id(&self) -> OperationId {
        self.future.id()
    }

    /// The prepared result, or the failure if the operation never prepared
    pub fn prepared_result(&self) -> &OperationOutcome {
        &self.prepared_result
    }

    /// Whether the operation ended before it prepared
    pub fn is_done(&self) -> bool {
        self.transaction.is_none()
    }

    pub fn commit(&self) -> Result<()> {
        self.transaction()?.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.transaction()?.rollback()
    }

    /// Terminal result of the operation
    pub fn future(&self) -> &OperationFuture {
        &self.future
    }

    fn transaction(&self) -> Result<&PreparedTransaction> {
        self.transaction
            .as_ref()
            .ok_or(ClientError::NotPrepared(self.future.id()))
    }
}

struct PrepareEvent {
    result: OperationOutcome,
    transaction: Option<PreparedTransaction>,
}

struct BlockingListener {
    slot: Sender<PrepareEvent>,
}

impl BlockingListener {
    fn offer(&self, event: PrepareEvent) {
        match self.slot.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                if let Some(transaction) = event.transaction {
                    tracing::warn!(
                        "Nobody is waiting for operation {}, rolling back",
                        transaction.id()
                    );
                    if let Err(e) = transaction.rollback() {
                        tracing::warn!(
                            "Failed to roll back operation {}: {}",
                            transaction.id(),
                            e
                        );
                    }
                }
            }
        }
    }
}

impl OperationListener for BlockingListener {
    fn operation_prepared(&self, transaction: PreparedTransaction, result: OperationOutcome) {
        self.offer(PrepareEvent {
            result,
            transaction: Some(transaction),
        });
    }

    fn operation_failed(&self, result: OperationOutcome) {
        self.offer(PrepareEvent {
            result,
            transaction: None,
        });
    }
}

/// Waits for the first phase of an operation started by `execute_blocking`
pub struct PendingPrepare {
    receiver: Receiver<PrepareEvent>,
    future: OperationFuture,
    default_timeout: Duration,
}

impl PendingPrepare {
    pub fn id(&self) -> OperationId {
        self.future.id()
    }

    pub fn future(&self) -> &OperationFuture {
        &self.future
    }

    /// Block until the operation prepared or failed
    ///
    /// Must not be called from an async task.
    pub fn recv(self) -> Result<PreparedOperation> {
        match self.receiver.recv() {
            Ok(event) => Ok(self.prepared(event)),
            // The listener is gone: the operation resolved without preparing
            Err(_) => self.resolved_without_prepare(),
        }
    }

    /// Block at most `timeout`
    ///
    /// On timeout the operation is rolled back and a timed-out failure is
    /// returned.
    pub fn recv_timeout(self, timeout: Duration) -> Result<PreparedOperation> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(self.prepared(event)),
            Err(RecvTimeoutError::Disconnected) => self.resolved_without_prepare(),
            Err(RecvTimeoutError::Timeout) => {
                let response = self.future.time_out(timeout)?;
                Ok(PreparedOperation {
                    prepared_result: response.into_outcome(),
                    transaction: None,
                    future: self.future,
                })
            }
        }
    }

    /// `recv_timeout` with the client's configured prepare timeout
    pub fn recv_default(self) -> Result<PreparedOperation> {
        let timeout = self.default_timeout;
        self.recv_timeout(timeout)
    }

    fn prepared(self, event: PrepareEvent) -> PreparedOperation {
        PreparedOperation {
            prepared_result: event.result,
            transaction: event.transaction,
            future: self.future,
        }
    }

    fn resolved_without_prepare(self) -> Result<PreparedOperation> {
        let response = self.future.wait_blocking()?;
        Ok(PreparedOperation {
            prepared_result: response.into_outcome(),
            transaction: None,
            future: self.future,
        })
    }
}

/// Start an operation for a synchronous caller
pub fn execute_blocking(client: &ManagementClient, envelope: Envelope) -> PendingPrepare {
    execute_blocking_with(client, envelope, ExecuteOptions::default())
}

/// `execute_blocking` with identity or in-VM options
pub fn execute_blocking_with(
    client: &ManagementClient,
    envelope: Envelope,
    options: ExecuteOptions,
) -> PendingPrepare {
    let (slot, receiver) = bounded(1);
    let listener = Arc::new(BlockingListener { slot });
    let future = client.execute_with(listener, envelope, options);

    PendingPrepare {
        receiver,
        future,
        default_timeout: client.config().prepare_timeout(),
    }
}
