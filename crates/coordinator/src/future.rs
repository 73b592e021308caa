//! Result container for one operation
//!
//! The slot is written once. Async waiters are woken through a `Notify`,
//! blocking waiters through a `Condvar`.

use crate::error::Result;
use crate::transaction::Exchange;
use parking_lot::{Condvar, Mutex};
use proven_common::{OperationId, OperationOutcome, OperationResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct FutureState {
    slot: Mutex<Option<Result<OperationResponse>>>,
    condvar: Condvar,
    notify: Notify,
}

impl FutureState {
    /// Fill the slot; hands back the result already there, if any
    fn store(
        &self,
        result: Result<OperationResponse>,
    ) -> std::result::Result<(), Result<OperationResponse>> {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(existing.clone());
        }
        *slot = Some(result);
        drop(slot);

        self.condvar.notify_all();
        self.notify.notify_waiters();
        Ok(())
    }

    fn complete(&self, result: Result<OperationResponse>) -> bool {
        self.store(result).is_ok()
    }

    /// The result that ends up in the slot: `result` or an earlier one
    fn settle(&self, result: Result<OperationResponse>) -> Result<OperationResponse> {
        match self.store(result.clone()) {
            Ok(()) => result,
            Err(existing) => existing,
        }
    }

    fn peek(&self) -> Option<Result<OperationResponse>> {
        self.slot.lock().clone()
    }

    async fn wait(&self) -> Result<OperationResponse> {
        loop {
            // Register before checking so a completion in between is not missed
            let notified = self.notify.notified();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }

    fn wait_blocking(&self) -> Result<OperationResponse> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.condvar.wait(&mut slot);
        }
    }

    fn wait_blocking_until(&self, deadline: Instant) -> Option<Result<OperationResponse>> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Some(result.clone());
            }
            if self.condvar.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }
}

/// Cancellable handle on the terminal result of an operation
///
/// Cancelling sends a rollback to the controller instead of abandoning the
/// operation locally, because the controller owns the transaction.
#[derive(Clone)]
pub struct OperationFuture {
    state: Arc<FutureState>,
    exchange: Arc<Exchange>,
}

impl OperationFuture {
    pub(crate) fn new(exchange: Arc<Exchange>) -> Self {
        Self {
            state: Arc::new(FutureState {
                slot: Mutex::new(None),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
            exchange,
        }
    }

    pub fn id(&self) -> OperationId {
        self.exchange.op_id()
    }

    pub fn is_done(&self) -> bool {
        self.state.slot.lock().is_some()
    }

    /// The result if the operation already finished
    pub fn try_result(&self) -> Option<Result<OperationResponse>> {
        self.state.peek()
    }

    /// Wait for the terminal result
    ///
    /// Dropping the returned future before it resolves cancels the
    /// operation.
    pub async fn get(&self) -> Result<OperationResponse> {
        let mut guard = CancelOnDrop {
            future: self,
            armed: true,
        };
        let result = self.state.wait().await;
        guard.armed = false;
        result
    }

    /// Wait at most `timeout`; afterwards roll back and report a timeout
    pub async fn get_timeout(&self, timeout: Duration) -> Result<OperationResponse> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => self.time_out(timeout),
        }
    }

    /// Block the calling thread until the terminal result arrives
    ///
    /// Must not be called from an async task.
    pub fn wait_blocking(&self) -> Result<OperationResponse> {
        self.state.wait_blocking()
    }

    /// Blocking variant of `get_timeout`
    pub fn wait_blocking_timeout(&self, timeout: Duration) -> Result<OperationResponse> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.state.wait_blocking();
        };
        match self.state.wait_blocking_until(deadline) {
            Some(result) => result,
            None => self.time_out(timeout),
        }
    }

    /// Ask the controller to roll back; returns whether a request was sent
    pub fn async_cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        tracing::debug!("Cancelling operation {}", self.id());
        self.exchange.cancel()
    }

    pub(crate) fn complete(&self, result: Result<OperationResponse>) -> bool {
        self.state.complete(result)
    }

    /// Resolves once a result is present, without cancel-on-drop
    pub(crate) async fn done(&self) {
        let _ = self.state.wait().await;
    }

    /// Roll back and settle on a timed-out failure after waiting `timeout`
    ///
    /// A result that arrived in the meantime wins.
    pub(crate) fn time_out(&self, timeout: Duration) -> Result<OperationResponse> {
        tracing::warn!(
            "Operation {} did not complete within {:?}, rolling back",
            self.id(),
            timeout
        );
        self.async_cancel();
        self.state
            .settle(Ok(OperationResponse::new(OperationOutcome::timed_out(
                format!("operation {} timed out after {:?}", self.id(), timeout),
            ))))
    }
}

impl std::fmt::Debug for OperationFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationFuture")
            .field("op_id", &self.id())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Turns an abandoned wait into a cancellation
struct CancelOnDrop<'a> {
    future: &'a OperationFuture,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.future.async_cancel();
        }
    }
}
