//! Request/response correlation and inbound request dispatch
//!
//! Every outbound request gets a per-connection request id. Responses echo
//! it and are routed to the sink registered for that request; a response
//! flagged partial keeps the sink registered, any other response releases
//! it. Inbound requests are parsed and handed to a `RequestHandler` together
//! with a `RequestContext` that owns the right to answer.

use crate::{ManagementRequest, ManagementResponse, ProtocolError, Result};
use dashmap::DashMap;
use proven_channel::message::{MSG_KIND, OP_ID, REQUEST_ID};
use proven_channel::{Channel, Message, MessageKind, MessageReceiver};
use proven_common::OperationId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

const PARTIAL: &str = "partial";

/// Where responses to a request are delivered
pub type ResponseSink = mpsc::UnboundedSender<ManagementResponse>;

/// Receiving side of a `ResponseSink`
pub type ResponseStream = mpsc::UnboundedReceiver<ManagementResponse>;

/// Handles requests initiated by the peer
pub trait RequestHandler: Send + Sync + 'static {
    /// Called on the dispatch task; implementations must not block
    fn handle_request(&self, ctx: RequestContext, request: ManagementRequest);

    /// Called once after the connection closed and all sinks were dropped
    fn connection_closed(&self) {}
}

struct PendingRequest {
    op_id: OperationId,
    sink: ResponseSink,
}

struct ConnectionInner {
    channel: Channel,
    next_request_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    closed: AtomicBool,
}

/// A protocol connection over one channel; cheap to clone
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start dispatching messages from `receiver`
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        channel: Channel,
        receiver: MessageReceiver,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                channel,
                next_request_id: AtomicU64::new(1),
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        };

        tokio::spawn(run_dispatch(connection.clone(), receiver, handler));
        connection
    }

    pub fn name(&self) -> &str {
        self.inner.channel.name()
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Send a request and get a stream of its responses
    pub fn request(&self, op_id: OperationId, request: ManagementRequest) -> Result<ResponseStream> {
        let (sink, stream) = mpsc::unbounded_channel();
        self.request_with_sink(op_id, request, sink)?;
        Ok(stream)
    }

    /// Send a request whose responses go to an existing sink
    ///
    /// Several requests of one operation may share a sink to get a single
    /// ordered response stream. Returns the request id.
    pub fn request_with_sink(
        &self,
        op_id: OperationId,
        request: ManagementRequest,
        sink: ResponseSink,
    ) -> Result<u64> {
        let request_id = self.next_request_id();
        let message = request_message(op_id, request_id, request)?;

        self.inner
            .pending
            .insert(request_id, PendingRequest { op_id, sink });

        // The dispatch task sets the flag before clearing, so one of the two
        // sides always drops this sink.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.remove(&request_id);
            return Err(ProtocolError::Closed);
        }

        if let Err(e) = self.inner.channel.send(message) {
            self.inner.pending.remove(&request_id);
            return Err(e.into());
        }

        tracing::trace!(
            "[{}] Sent request {} for operation {}",
            self.name(),
            request_id,
            op_id
        );
        Ok(request_id)
    }

    /// Send a request that expects no response
    pub fn notify(&self, op_id: OperationId, request: ManagementRequest) -> Result<()> {
        let request_id = self.next_request_id();
        let message = request_message(op_id, request_id, request)?;
        self.inner.channel.send(message)?;
        Ok(())
    }

    /// Drop the sinks of every outstanding request of an operation
    pub fn discard_operation(&self, op_id: OperationId) {
        self.inner.pending.retain(|_, pending| pending.op_id != op_id);
    }

    /// Drop the sink of one outstanding request
    pub fn discard_request(&self, request_id: u64) {
        self.inner.pending.remove(&request_id);
    }

    /// Number of requests still awaiting a final response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn close(&self) {
        self.inner.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.channel.is_closed()
    }

    /// Wait until the underlying channel is closed
    pub async fn closed(&self) {
        self.inner.channel.closed().await
    }

    /// Fails with `FrameTooLarge` if `response` cannot be sent on this
    /// connection as one frame
    pub fn check_response(&self, op_id: OperationId, response: &ManagementResponse) -> Result<()> {
        let message = self.response_message(op_id, u64::MAX, response.clone(), true)?;
        self.inner.channel.check_frame(&message)?;
        Ok(())
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn response_message(
        &self,
        op_id: OperationId,
        request_id: u64,
        response: ManagementResponse,
        partial: bool,
    ) -> Result<Message> {
        let mut message = response
            .into_message()?
            .with_header(MSG_KIND, MessageKind::Response.as_str())
            .with_header(OP_ID, op_id.to_string())
            .with_header(REQUEST_ID, request_id.to_string());
        if partial {
            message = message.with_header(PARTIAL, "true");
        }
        Ok(message)
    }

    fn dispatch_request(&self, message: Message, handler: &Arc<dyn RequestHandler>) {
        let (Some(op_id), Some(request_id)) = (message.op_id(), message.request_id()) else {
            tracing::warn!("[{}] Dropping request without routing headers", self.name());
            return;
        };

        let ctx = RequestContext {
            connection: self.clone(),
            op_id,
            request_id,
        };

        match ManagementRequest::from_message(&message) {
            Ok(request) => {
                tracing::trace!(
                    "[{}] Received {:?} for operation {}",
                    self.name(),
                    request.request_type(),
                    op_id
                );
                handler.handle_request(ctx, request);
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] Rejecting malformed request for operation {}: {}",
                    self.name(),
                    op_id,
                    e
                );
                let _ = ctx.send(ManagementResponse::error(e.to_string()));
            }
        }
    }

    fn route_response(&self, message: Message) {
        let Some(request_id) = message.request_id() else {
            tracing::warn!("[{}] Dropping response without request id", self.name());
            return;
        };
        let partial = message.get_header(PARTIAL) == Some("true");

        let response = ManagementResponse::from_message(&message).unwrap_or_else(|e| {
            tracing::warn!("[{}] Malformed response to request {}: {}", self.name(), request_id, e);
            ManagementResponse::error(e.to_string())
        });

        let delivered = if partial {
            self.inner
                .pending
                .get(&request_id)
                .map(|pending| pending.sink.send(response).is_ok())
        } else {
            self.inner
                .pending
                .remove(&request_id)
                .map(|(_, pending)| pending.sink.send(response).is_ok())
        };

        match delivered {
            Some(true) => {}
            Some(false) => {
                self.inner.pending.remove(&request_id);
            }
            None => tracing::debug!(
                "[{}] Response to unknown or discarded request {}",
                self.name(),
                request_id
            ),
        }
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.channel.close();
        self.inner.pending.clear();
    }
}

fn request_message(
    op_id: OperationId,
    request_id: u64,
    request: ManagementRequest,
) -> Result<Message> {
    Ok(request
        .into_message()?
        .with_header(MSG_KIND, MessageKind::Request.as_str())
        .with_header(OP_ID, op_id.to_string())
        .with_header(REQUEST_ID, request_id.to_string()))
}

async fn run_dispatch(
    connection: Connection,
    mut receiver: MessageReceiver,
    handler: Arc<dyn RequestHandler>,
) {
    while let Some(message) = receiver.recv().await {
        match message.kind() {
            Some(MessageKind::Request) => connection.dispatch_request(message, &handler),
            Some(MessageKind::Response) => connection.route_response(message),
            None => tracing::warn!("[{}] Dropping message without kind", connection.name()),
        }
    }

    tracing::debug!("[{}] Connection closed", connection.name());
    connection.shutdown();
    handler.connection_closed();
}

/// The right to answer one inbound request
///
/// Partial responses may be sent any number of times; the final response
/// consumes the context, so a request is never answered twice.
pub struct RequestContext {
    connection: Connection,
    op_id: OperationId,
    request_id: u64,
}

impl RequestContext {
    pub fn op_id(&self) -> OperationId {
        self.op_id
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send a non-final response
    pub fn send_partial(&self, response: ManagementResponse) -> Result<()> {
        let message = self
            .connection
            .response_message(self.op_id, self.request_id, response, true)?;
        self.connection.inner.channel.send(message)?;
        Ok(())
    }

    /// Send a non-final response and get notified once it was written
    pub fn send_partial_confirmed(
        &self,
        response: ManagementResponse,
    ) -> Result<oneshot::Receiver<proven_channel::Result<()>>> {
        let message = self
            .connection
            .response_message(self.op_id, self.request_id, response, true)?;
        Ok(self.connection.inner.channel.send_confirmed(message))
    }

    /// Enqueue the final response
    pub fn send(self, response: ManagementResponse) -> Result<()> {
        let message = self
            .connection
            .response_message(self.op_id, self.request_id, response, false)?;
        self.connection.inner.channel.send(message)?;
        Ok(())
    }

    /// Enqueue the final response and get notified once it was written
    pub fn send_confirmed(
        self,
        response: ManagementResponse,
    ) -> Result<oneshot::Receiver<proven_channel::Result<()>>> {
        let message = self
            .connection
            .response_message(self.op_id, self.request_id, response, false)?;
        Ok(self.connection.inner.channel.send_confirmed(message))
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("op_id", &self.op_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}
