//! Server-side coordinator

use crate::config::ControllerConfig;
use crate::context::OperationContext;
use crate::engine::{EngineError, NoopTransaction, OperationEngine};
use crate::operation::{Finished, ServerOperation};
use crate::state::Phase;
use crate::Result;
use lru::LruCache;
use parking_lot::Mutex;
use proven_channel::registry::CompletionCallback;
use proven_channel::{ActiveOperation, ActiveOperationRegistry, Channel, MessageReceiver, WorkerPool};
use proven_common::{OperationId, OperationOutcome, OperationResponse};
use proven_protocol::{
    AttachmentTable, Connection, Decision, ExecuteRequest, ManagementRequest, ManagementResponse,
    RequestContext, RequestHandler,
};
use std::num::NonZeroUsize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

type CompletedHistory = Arc<Mutex<LruCache<OperationId, ()>>>;

struct ControllerShared {
    engine: Arc<dyn OperationEngine>,
    operations: ActiveOperationRegistry<ServerOperation>,
    completed: CompletedHistory,
    attachments: AttachmentTable,
    pool: Arc<WorkerPool>,
    config: ControllerConfig,
}

/// Executes operations requested by a client over one connection
pub struct ManagementController {
    connection: Connection,
    shared: Arc<ControllerShared>,
}

impl ManagementController {
    /// Serve one end of a channel, running operations on `pool`
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        channel: Channel,
        receiver: MessageReceiver,
        engine: Arc<dyn OperationEngine>,
        pool: Arc<WorkerPool>,
        config: ControllerConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.completed_history).unwrap_or(NonZeroUsize::MIN);
        let shared = Arc::new(ControllerShared {
            engine,
            operations: ActiveOperationRegistry::new(),
            completed: Arc::new(Mutex::new(LruCache::new(capacity))),
            attachments: AttachmentTable::new(config.attachment_chunk_size),
            pool,
            config,
        });
        let connection = Connection::open(
            channel,
            receiver,
            Arc::new(ControllerRequestHandler {
                shared: shared.clone(),
            }),
        );

        tracing::debug!("[{}] Controller started", connection.name());
        Self { connection, shared }
    }

    /// `connect` with a worker pool of `config.worker_threads` threads
    pub fn start(
        channel: Channel,
        receiver: MessageReceiver,
        engine: Arc<dyn OperationEngine>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::new("management-worker", config.worker_threads)?;
        Ok(Self::connect(channel, receiver, engine, Arc::new(pool), config))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    /// Operations still registered, early-Complete placeholders included
    pub fn active_operations(&self) -> usize {
        self.shared.operations.len()
    }

    /// Phase of a registered operation
    pub fn phase(&self, op_id: OperationId) -> Option<Phase> {
        self.shared
            .operations
            .lookup(op_id)
            .map(|active| active.attachment().phase())
    }

    /// Whether the operation finished recently enough to be remembered
    pub fn is_completed(&self, op_id: OperationId) -> bool {
        self.shared.completed.lock().contains(&op_id)
    }

    /// Number of response streams not yet closed by the client
    pub fn open_streams(&self) -> usize {
        self.shared.attachments.len()
    }

    /// Close the connection; prepared operations roll back
    pub fn close(&self) {
        self.connection.close();
    }
}

impl ControllerShared {
    fn execute(self: &Arc<Self>, ctx: RequestContext, request: ExecuteRequest) {
        let op_id = ctx.op_id();
        self.sweep_orphans();

        let completed = self.completed.clone();
        let on_complete: CompletionCallback = Box::new(move |id| {
            completed.lock().put(id, ());
        });
        let active = match self
            .operations
            .register(
                op_id,
                ServerOperation::new(op_id, ctx.connection().clone()),
                Some(on_complete),
            )
        {
            Ok(active) => active,
            Err(rejected) => {
                reject_execute(ctx, &rejected.existing);
                return;
            }
        };

        tracing::debug!(
            "Executing operation {} with {} attachments",
            op_id,
            request.attachment_count
        );
        let connection = ctx.connection().clone();
        active.attachment().start(ctx);
        let op_ctx = OperationContext::new(active.clone(), &connection, request);

        let shared = self.clone();
        let job = active.clone();
        if let Err(e) = self.pool.execute(move || shared.run(job, op_ctx)) {
            tracing::warn!("Cannot run operation {}: {}", op_id, e);
            let result = Err(EngineError::new("Unavailable", e.to_string()));
            match active.attachment().finish(result, &self.attachments) {
                Finished::Cached => {}
                Finished::Sent(_) | Finished::Dropped => {
                    active.complete();
                }
            }
        }
    }

    /// Body of one worker-pool job
    fn run(&self, active: Arc<ActiveOperation<ServerOperation>>, mut ctx: OperationContext) {
        let op_id = active.id();
        let operation = active.attachment();

        let result = if operation.is_cancelled() {
            tracing::debug!("Operation {} cancelled before it started", op_id);
            Ok(OperationResponse::new(OperationOutcome::Cancelled))
        } else {
            self.execute_engine(&mut ctx)
        };

        match operation.finish(result, &self.attachments) {
            Finished::Sent(confirm) => {
                if let Ok(Err(e)) = confirm.blocking_recv() {
                    tracing::warn!("Response of operation {} was not written: {}", op_id, e);
                }
                active.complete();
            }
            Finished::Dropped => {
                active.complete();
            }
            Finished::Cached => {}
        }
    }

    fn execute_engine(
        &self,
        ctx: &mut OperationContext,
    ) -> std::result::Result<OperationResponse, EngineError> {
        let result = match catch_unwind(AssertUnwindSafe(|| self.engine.execute(ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let error = EngineError::from_panic(panic);
                tracing::error!("Operation {} panicked: {}", ctx.id(), error.message);
                Err(error)
            }
        };

        match result {
            Ok(response) if !ctx.prepared_by_engine() && response.outcome().is_success() => {
                auto_prepare(ctx, response)
            }
            other => other,
        }
    }

    fn complete(&self, ctx: RequestContext, decision: Decision) {
        let op_id = ctx.op_id();
        if let Some(active) = self.operations.lookup(op_id) {
            if active.attachment().complete(ctx, decision) {
                active.complete();
            }
            return;
        }

        if self.completed.lock().contains(&op_id) {
            tracing::debug!("Late Complete for finished operation {}", op_id);
            if let Err(e) = ctx.send(ManagementResponse::RequestEnd) {
                tracing::warn!("Failed to acknowledge Complete of operation {}: {}", op_id, e);
            }
            return;
        }

        // Answered through the Execute once it shows up
        tracing::warn!(
            "Complete ({}) for operation {} arrived before its Execute",
            decision.as_str(),
            op_id
        );
        let placeholder = ServerOperation::placeholder(op_id, ctx.connection().clone(), decision);
        if self.operations.register(op_id, placeholder, None).is_err() {
            tracing::debug!("Operation {} registered concurrently", op_id);
        }
    }

    fn cancel_async(&self, ctx: RequestContext) {
        let op_id = ctx.op_id();
        if let Err(e) = ctx.send(ManagementResponse::RequestEnd) {
            tracing::warn!("Failed to acknowledge cancel of operation {}: {}", op_id, e);
        }

        match self.operations.lookup(op_id) {
            Some(active) => {
                tracing::debug!("Cancelling operation {}", op_id);
                active.attachment().cancel();
            }
            None => tracing::debug!("Cancel for unknown operation {}", op_id),
        }
    }

    fn sweep_orphans(&self) {
        let ttl = self.config.orphan_ttl();
        for active in self.operations.operations() {
            if active.attachment().is_orphan(ttl) {
                tracing::debug!("Dropping early Complete for operation {}", active.id());
                active.complete();
            }
        }
    }

    fn connection_lost(&self) {
        let operations = self.operations.drain();
        if !operations.is_empty() {
            tracing::warn!("Connection lost with {} operations in flight", operations.len());
        }
        for active in operations {
            active.attachment().connection_lost();
        }
        self.attachments.clear();
    }
}

/// Answer an Execute whose id is already taken
fn reject_execute(ctx: RequestContext, existing: &ActiveOperation<ServerOperation>) {
    let op_id = ctx.op_id();
    let response = match existing.attachment().early_decision() {
        Some(Decision::Rollback) => {
            tracing::debug!("Operation {} was cancelled before it arrived", op_id);
            existing.complete();
            ManagementResponse::Cancelled
        }
        Some(Decision::Commit) => {
            tracing::error!("Commit for operation {} arrived before the operation", op_id);
            existing.complete();
            ManagementResponse::error(format!(
                "commit received before operation {} was executed",
                op_id
            ))
        }
        None => {
            tracing::warn!("Operation {} is already executing", op_id);
            ManagementResponse::error(format!("operation {} is already executing", op_id))
        }
    };

    if let Err(e) = ctx.send(response) {
        tracing::warn!("Failed to reject operation {}: {}", op_id, e);
    }
}

/// Prepare an operation the engine finished without preparing
fn auto_prepare(
    ctx: &mut OperationContext,
    response: OperationResponse,
) -> std::result::Result<OperationResponse, EngineError> {
    let prepared = response.outcome().clone();
    match ctx.prepared(Box::new(NoopTransaction), prepared)? {
        Decision::Commit => Ok(response),
        Decision::Rollback => Ok(OperationResponse::new(OperationOutcome::rolled_back(
            "operation was rolled back",
        ))),
    }
}

struct ControllerRequestHandler {
    shared: Arc<ControllerShared>,
}

impl RequestHandler for ControllerRequestHandler {
    fn handle_request(&self, ctx: RequestContext, request: ManagementRequest) {
        match request {
            ManagementRequest::Execute(execute) => self.shared.execute(ctx, execute),
            ManagementRequest::Complete { decision } => self.shared.complete(ctx, decision),
            ManagementRequest::CancelAsync => self.shared.cancel_async(ctx),
            ManagementRequest::GetAttachment { index } => self.shared.attachments.serve(ctx, index),
            ManagementRequest::CloseAttachment { index } => {
                if !self.shared.attachments.close(ctx.op_id(), index) {
                    tracing::debug!(
                        "Close for unknown stream {} of operation {}",
                        index,
                        ctx.op_id()
                    );
                }
            }
            ManagementRequest::HandleReport { .. } => {
                let op_id = ctx.op_id();
                tracing::warn!("Rejecting report request for operation {}", op_id);
                if let Err(e) = ctx.send(ManagementResponse::error(
                    "handle_report is not served by the controller",
                )) {
                    tracing::warn!("Failed to reject report for operation {}: {}", op_id, e);
                }
            }
        }
    }

    fn connection_closed(&self) {
        self.shared.connection_lost();
    }
}
