//! One server-side operation: its coordinator state, latch and cancel flag

use crate::engine::{EngineError, EngineTransaction};
use crate::latch::Latch;
use crate::state::{CompleteStep, CoordinatorState, FinishStep, Phase, PrepareStep};
use parking_lot::Mutex;
use proven_common::{OperationId, OperationOutcome, OperationResponse};
use proven_protocol::{AttachmentTable, Connection, Decision, ManagementResponse, RequestContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Completion of a written terminal response
pub(crate) type SendConfirmation = oneshot::Receiver<proven_channel::Result<()>>;

/// Where the terminal response went
pub(crate) enum Finished {
    /// Enqueued; resolves once written
    Sent(SendConfirmation),
    /// Held for the next Complete
    Cached,
    /// Nobody to answer
    Dropped,
}

enum AfterPrepare {
    Park(SendConfirmation),
    RollBack(Option<Box<dyn EngineTransaction>>),
    Rejected(Box<dyn EngineTransaction>),
}

pub(crate) struct ServerOperation {
    id: OperationId,
    connection: Connection,
    state: Mutex<CoordinatorState<RequestContext>>,
    latch: Latch,
    cancelled: AtomicBool,
    created_at: Instant,
}

impl ServerOperation {
    pub(crate) fn new(id: OperationId, connection: Connection) -> Self {
        Self::with_state(id, connection, CoordinatorState::new())
    }

    /// Stand-in registered by a Complete that arrived before its Execute
    pub(crate) fn placeholder(id: OperationId, connection: Connection, decision: Decision) -> Self {
        let operation = Self::with_state(id, connection, CoordinatorState::placeholder(decision));
        operation.cancelled.store(true, Ordering::SeqCst);
        operation
    }

    fn with_state(
        id: OperationId,
        connection: Connection,
        state: CoordinatorState<RequestContext>,
    ) -> Self {
        Self {
            id,
            connection,
            state: Mutex::new(state),
            latch: Latch::new(),
            cancelled: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.state.lock().is_prepared()
    }

    /// Decision carried by an early Complete, if this is a placeholder
    pub(crate) fn early_decision(&self) -> Option<Decision> {
        self.state.lock().early_decision()
    }

    /// A placeholder whose Execute never showed up
    pub(crate) fn is_orphan(&self, ttl: Duration) -> bool {
        self.early_decision().is_some() && self.created_at.elapsed() >= ttl
    }

    pub(crate) fn start(&self, ctx: RequestContext) {
        self.state.lock().start(ctx);
    }

    /// Handle a Complete request; returns true once the operation is done
    pub(crate) fn complete(&self, ctx: RequestContext, decision: Decision) -> bool {
        let mut state = self.state.lock();
        match state.on_complete(ctx, decision) {
            CompleteStep::Deferred => {
                tracing::debug!(
                    "Operation {} cancelled before prepare ({})",
                    self.id,
                    decision.as_str()
                );
                self.cancelled.store(true, Ordering::SeqCst);
                false
            }
            CompleteStep::Release => {
                tracing::debug!("Operation {} decided: {}", self.id, decision.as_str());
                self.latch.release();
                false
            }
            CompleteStep::Attached => false,
            CompleteStep::Flush(ctx, response) => {
                tracing::debug!("Flushing cached response of operation {}", self.id);
                if let Err(e) = ctx.send(response) {
                    tracing::warn!("Failed to send response of operation {}: {}", self.id, e);
                }
                true
            }
            CompleteStep::Late(ctx) => {
                tracing::debug!("Operation {} already decided, treating Complete as cancel", self.id);
                self.cancelled.store(true, Ordering::SeqCst);
                if let Err(e) = ctx.send(ManagementResponse::RequestEnd) {
                    tracing::warn!("Failed to acknowledge Complete of operation {}: {}", self.id, e);
                }
                false
            }
        }
    }

    /// Out-of-band cancellation
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.state.lock().on_cancel() {
            tracing::debug!("Operation {} cancelled while awaiting Complete", self.id);
            self.latch.release();
        }
    }

    pub(crate) fn connection_lost(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.state.lock().on_connection_lost() {
            tracing::warn!("Connection lost while operation {} was prepared, rolling back", self.id);
        }
        self.latch.release();
    }

    /// Why `response` cannot be sent, if it exceeds the frame limit
    fn oversized(&self, response: &ManagementResponse) -> Option<String> {
        let e = self.connection.check_response(self.id, response).err()?;
        tracing::warn!(
            "{} response of operation {} cannot be sent: {}",
            response.response_type().as_str(),
            self.id,
            e
        );
        Some(format!(
            "{} response too large to send: {}",
            response.response_type().as_str(),
            e
        ))
    }

    /// Report prepare and block until the decision is in, then apply it
    ///
    /// Runs on the engine's worker thread.
    pub(crate) fn prepared(
        &self,
        transaction: Box<dyn EngineTransaction>,
        result: OperationOutcome,
    ) -> Result<Decision, EngineError> {
        let next = {
            let mut state = self.state.lock();
            match state.on_prepared(transaction, result, |response| self.oversized(response)) {
                PrepareStep::Respond(ctx, response) => match ctx.send_confirmed(response) {
                    Ok(confirm) => AfterPrepare::Park(confirm),
                    Err(e) => {
                        tracing::warn!("Failed to send Prepared for operation {}: {}", self.id, e);
                        AfterPrepare::RollBack(state.abandon_prepare())
                    }
                },
                PrepareStep::RollBack(transaction) => AfterPrepare::RollBack(Some(transaction)),
                PrepareStep::Rejected(transaction) => AfterPrepare::Rejected(transaction),
            }
        };

        match next {
            AfterPrepare::RollBack(transaction) => {
                tracing::debug!("Operation {} rolled back at prepare", self.id);
                if let Some(transaction) = transaction {
                    transaction.rollback();
                }
                Ok(Decision::Rollback)
            }
            AfterPrepare::Rejected(transaction) => {
                tracing::error!("Operation {} reported prepare twice", self.id);
                transaction.rollback();
                Err(EngineError::new(
                    "IllegalState",
                    format!("operation {} is already prepared", self.id),
                ))
            }
            AfterPrepare::Park(confirm) => {
                if !matches!(confirm.blocking_recv(), Ok(Ok(()))) {
                    tracing::warn!("Prepared response of operation {} was not written", self.id);
                    if let Some(transaction) = self.state.lock().abandon_prepare() {
                        transaction.rollback();
                    }
                    return Ok(Decision::Rollback);
                }

                tracing::debug!("Operation {} prepared, awaiting Complete", self.id);
                self.latch.wait();

                let (decision, transaction) = self.state.lock().take_decision();
                let Some(transaction) = transaction else {
                    return Ok(Decision::Rollback);
                };
                match decision {
                    Decision::Commit => transaction.commit().map(|()| Decision::Commit),
                    Decision::Rollback => {
                        transaction.rollback();
                        Ok(Decision::Rollback)
                    }
                }
            }
        }
    }

    /// Route the terminal result of the execution
    ///
    /// Response streams are registered in `attachments` before the response
    /// that announces them is sent.
    pub(crate) fn finish(
        &self,
        result: Result<OperationResponse, EngineError>,
        attachments: &AttachmentTable,
    ) -> Finished {
        let leftover = self.state.lock().take_leftover_transaction();
        if let Some(transaction) = leftover {
            tracing::warn!("Operation {} ended while prepared, rolling back", self.id);
            transaction.rollback();
        }

        let mut state = self.state.lock();
        let (step, streams) = state.finish(result, |response| self.oversized(response));
        let finished = match step {
            FinishStep::Respond(ctx, response) => {
                if !streams.is_empty() {
                    attachments.insert(self.id, &streams);
                }
                match ctx.send_confirmed(response) {
                    Ok(confirm) => Finished::Sent(confirm),
                    Err(e) => {
                        tracing::warn!("Failed to send response of operation {}: {}", self.id, e);
                        attachments.remove_operation(self.id);
                        Finished::Dropped
                    }
                }
            }
            FinishStep::Cached => {
                tracing::debug!("Operation {} finished before its Complete arrived", self.id);
                if !streams.is_empty() {
                    attachments.insert(self.id, &streams);
                }
                Finished::Cached
            }
            FinishStep::Dropped => {
                tracing::debug!("Dropping response of operation {}: peer is gone", self.id);
                Finished::Dropped
            }
        };
        drop(state);

        self.latch.release();
        finished
    }
}
