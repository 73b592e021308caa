//! Client-side coordinator

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::future::OperationFuture;
use crate::listener::OperationListener;
use crate::transaction::{Exchange, PreparedTransaction};
use proven_channel::registry::CompletionCallback;
use proven_channel::{ActiveOperation, ActiveOperationRegistry, Channel, ChannelError, MessageReceiver};
use proven_common::{
    AttachmentSource, Envelope, Identity, OperationId, OperationOutcome, OperationResponse,
};
use proven_protocol::{
    AttachmentTable, Connection, ExecuteRequest, ManagementRequest, ManagementResponse,
    ProtocolError, RemoteAttachment, RequestContext, RequestHandler, ResponseStream,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Optional fields of an Execute request
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub identity: Option<Identity>,
    pub in_vm: bool,
}

impl ExecuteOptions {
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn in_vm(mut self, in_vm: bool) -> Self {
        self.in_vm = in_vm;
        self
    }
}

/// Client-side record of one in-flight operation
pub(crate) struct ClientOperation {
    listener: Arc<dyn OperationListener>,
    envelope: Envelope,
    future: OperationFuture,
}

struct ClientShared {
    operations: ActiveOperationRegistry<ClientOperation>,
    attachments: AttachmentTable,
}

/// Sends operations to a controller and drives their exchanges
#[derive(Clone)]
pub struct ManagementClient {
    connection: Connection,
    shared: Arc<ClientShared>,
    config: ClientConfig,
    runtime: Handle,
}

impl ManagementClient {
    /// Start a client on one end of a channel
    ///
    /// Must be called from within a tokio runtime. The returned client may
    /// be used from any thread afterwards.
    pub fn connect(channel: Channel, receiver: MessageReceiver, config: ClientConfig) -> Self {
        let shared = Arc::new(ClientShared {
            operations: ActiveOperationRegistry::new(),
            attachments: AttachmentTable::new(config.attachment_chunk_size),
        });
        let connection = Connection::open(
            channel,
            receiver,
            Arc::new(ClientRequestHandler {
                shared: shared.clone(),
            }),
        );

        Self {
            connection,
            shared,
            config,
            runtime: Handle::current(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of operations whose terminal result has not been processed
    pub fn active_operations(&self) -> usize {
        self.shared.operations.len()
    }

    /// Send an operation to the controller
    pub fn execute(&self, listener: Arc<dyn OperationListener>, envelope: Envelope) -> OperationFuture {
        self.execute_with(listener, envelope, ExecuteOptions::default())
    }

    /// Send an operation with identity or in-VM options
    ///
    /// The Execute request is sent from a spawned task, never from the
    /// caller or the connection's dispatch task.
    pub fn execute_with(
        &self,
        listener: Arc<dyn OperationListener>,
        envelope: Envelope,
        options: ExecuteOptions,
    ) -> OperationFuture {
        let op_id = self.shared.operations.next_id();
        let (sink, responses) = mpsc::unbounded_channel();
        let exchange = Arc::new(Exchange::new(op_id, self.connection.clone(), sink));
        let future = OperationFuture::new(exchange.clone());

        let request = ManagementRequest::Execute(ExecuteRequest {
            operation: envelope.operation().clone(),
            attachment_count: envelope.attachment_count() as u32,
            identity: options.identity,
            in_vm: options.in_vm,
        });
        self.shared.attachments.insert(op_id, envelope.attachments());

        let shared = self.shared.clone();
        let connection = self.connection.clone();
        let on_complete: CompletionCallback = Box::new(move |id| {
            connection.discard_operation(id);
            shared.attachments.remove_operation(id);
        });

        let operation = ClientOperation {
            listener,
            envelope,
            future: future.clone(),
        };
        let active = match self
            .shared
            .operations
            .register(op_id, operation, Some(on_complete))
        {
            Ok(active) => active,
            Err(rejected) => {
                tracing::error!("Operation id {} handed out twice", rejected.existing.id());
                self.shared.attachments.remove_operation(op_id);
                future.complete(Err(ClientError::Protocol(
                    ChannelError::AlreadyRegistered(op_id).into(),
                )));
                return future;
            }
        };

        tracing::debug!("Executing operation {}", op_id);
        self.runtime
            .spawn(run_exchange(active, exchange, request, responses));
        future
    }

    /// Ask the controller to cancel an operation out of band
    ///
    /// Resolves once the controller acknowledged the request.
    pub async fn cancel_async(&self, op_id: OperationId) -> Result<()> {
        let mut responses = self
            .connection
            .request(op_id, ManagementRequest::CancelAsync)
            .map_err(|e| closed_or(op_id, e))?;

        match responses.recv().await {
            Some(ManagementResponse::RequestEnd) => Ok(()),
            Some(ManagementResponse::Error { description }) => Err(ClientError::Remote(description)),
            Some(other) => Err(ClientError::Remote(format!(
                "unexpected {} response to cancel",
                other.response_type().as_str()
            ))),
            None => Err(ClientError::ChannelClosed(op_id)),
        }
    }

    /// Close the connection; outstanding operations fail with `ChannelClosed`
    pub fn close(&self) {
        self.connection.close();
    }
}

fn closed_or(op_id: OperationId, error: ProtocolError) -> ClientError {
    match error {
        ProtocolError::Closed | ProtocolError::Channel(ChannelError::Closed) => {
            ClientError::ChannelClosed(op_id)
        }
        other => other.into(),
    }
}

/// Releases the registry entry however the exchange task ends
///
/// The entry is released before the result is published, so discarding the
/// exchange's requests cannot race with reads of the response streams. If
/// the task is dropped before the operation resolved (runtime shutdown,
/// abort) the operation is cancelled rather than silently abandoned.
struct ExchangeGuard {
    active: Arc<ActiveOperation<ClientOperation>>,
    result: Option<Result<OperationResponse>>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        let future = &self.active.attachment().future;
        let result = match self.result.take() {
            Some(result) => result,
            None => {
                if !future.is_done() {
                    future.async_cancel();
                }
                Err(ClientError::ChannelClosed(self.active.id()))
            }
        };
        self.active.complete();
        future.complete(result);
    }
}

async fn run_exchange(
    active: Arc<ActiveOperation<ClientOperation>>,
    exchange: Arc<Exchange>,
    request: ManagementRequest,
    mut responses: ResponseStream,
) {
    let op_id = active.id();
    let mut guard = ExchangeGuard {
        active: active.clone(),
        result: None,
    };
    let operation = active.attachment();

    if let Err(e) = exchange
        .connection()
        .request_with_sink(op_id, request, exchange.sink().clone())
    {
        tracing::warn!("Failed to send operation {}: {}", op_id, e);
        guard.result = Some(Err(closed_or(op_id, e)));
        return;
    }

    loop {
        let response = tokio::select! {
            biased;
            response = responses.recv() => response,
            // Resolved elsewhere: timeout or connection loss
            _ = operation.future.done() => break,
        };

        let Some(response) = response else {
            guard.result = Some(Err(ClientError::ChannelClosed(op_id)));
            break;
        };

        if let Some(result) = handle_response(operation, &exchange, response) {
            guard.result = Some(result);
            break;
        }
    }
}

/// Apply one response; returns the terminal result once there is one
fn handle_response(
    operation: &ClientOperation,
    exchange: &Arc<Exchange>,
    response: ManagementResponse,
) -> Option<Result<OperationResponse>> {
    let op_id = exchange.op_id();
    match response {
        ManagementResponse::Prepared { result } => {
            tracing::debug!("Operation {} prepared", op_id);
            operation
                .listener
                .operation_prepared(PreparedTransaction::new(exchange.clone()), result);
            None
        }
        ManagementResponse::Failed { result } => {
            tracing::debug!("Operation {} failed before prepare", op_id);
            operation.listener.operation_failed(result.clone());
            Some(Ok(OperationResponse::new(result)))
        }
        ManagementResponse::Completed {
            result,
            stream_count,
        } => {
            tracing::debug!(
                "Operation {} completed with {} streams",
                op_id,
                stream_count
            );
            let response = if stream_count > 0 {
                let streams = RemoteAttachment::all(exchange.connection(), op_id, stream_count)
                    .into_iter()
                    .map(|stream| Arc::new(stream) as Arc<dyn AttachmentSource>)
                    .collect();
                OperationResponse::with_streams(result, streams)
            } else {
                OperationResponse::new(result)
            };
            operation.listener.operation_completed(&response);
            Some(Ok(response))
        }
        ManagementResponse::Cancelled => {
            tracing::debug!("Operation {} cancelled", op_id);
            Some(Ok(OperationResponse::new(OperationOutcome::Cancelled)))
        }
        ManagementResponse::RequestEnd => None,
        ManagementResponse::AttachmentData(_) => {
            tracing::warn!("Unexpected attachment data for operation {}", op_id);
            None
        }
        ManagementResponse::Error { description } => {
            tracing::warn!("Operation {} failed: {}", op_id, description);
            Some(Err(ClientError::Remote(description)))
        }
    }
}

/// Serves envelope attachments and message reports to the controller
struct ClientRequestHandler {
    shared: Arc<ClientShared>,
}

impl RequestHandler for ClientRequestHandler {
    fn handle_request(&self, ctx: RequestContext, request: ManagementRequest) {
        match request {
            ManagementRequest::GetAttachment { index } => self.shared.attachments.serve(ctx, index),
            ManagementRequest::CloseAttachment { index } => {
                self.shared.attachments.close(ctx.op_id(), index);
            }
            ManagementRequest::HandleReport { severity, message } => {
                let Some(active) = self.shared.operations.lookup(ctx.op_id()) else {
                    tracing::debug!("Report for finished operation {}: {}", ctx.op_id(), message);
                    return;
                };
                if let Some(handler) = active.attachment().envelope.message_handler() {
                    handler.handle_report(severity, &message);
                }
            }
            other => {
                let op_id = ctx.op_id();
                let request_type = other.request_type().as_str();
                tracing::warn!("Rejecting {} request for operation {}", request_type, op_id);
                let description = format!("{} is not served by the client", request_type);
                if let Err(e) = ctx.send(ManagementResponse::error(description)) {
                    tracing::warn!(
                        "Failed to reject {} request for operation {}: {}",
                        request_type,
                        op_id,
                        e
                    );
                }
            }
        }
    }

    fn connection_closed(&self) {
        for active in self.shared.operations.operations() {
            active
                .attachment()
                .future
                .complete(Err(ClientError::ChannelClosed(active.id())));
        }
        self.shared.attachments.clear();
    }
}
