//! What the engine sees of one operation

use crate::engine::{EngineError, EngineTransaction};
use crate::operation::ServerOperation;
use crate::Result;
use proven_channel::ActiveOperation;
use proven_common::{
    AttachmentSource, Envelope, Identity, MessageHandler, MessageSeverity, OperationId,
    OperationOutcome,
};
use proven_protocol::{Connection, Decision, ExecuteRequest, ManagementRequest, RemoteAttachment};
use serde_json::Value;
use std::sync::Arc;

/// Forwards progress messages to the client's message handler
struct RemoteReporter {
    connection: Connection,
    op_id: OperationId,
}

impl RemoteReporter {
    fn report(&self, severity: MessageSeverity, message: &str) -> Result<()> {
        self.connection.notify(
            self.op_id,
            ManagementRequest::HandleReport {
                severity,
                message: message.to_string(),
            },
        )?;
        Ok(())
    }
}

impl MessageHandler for RemoteReporter {
    fn handle_report(&self, severity: MessageSeverity, message: &str) {
        if let Err(e) = self.report(severity, message) {
            tracing::debug!("Dropped report for operation {}: {}", self.op_id, e);
        }
    }
}

/// Execution context handed to `OperationEngine::execute`
///
/// The envelope's attachments are proxies for the client's streams and its
/// message handler forwards to the client. Reading an attachment blocks.
pub struct OperationContext {
    active: Arc<ActiveOperation<ServerOperation>>,
    envelope: Envelope,
    reporter: Arc<RemoteReporter>,
    identity: Option<Identity>,
    in_vm: bool,
    prepared_by_engine: bool,
}

impl OperationContext {
    pub(crate) fn new(
        active: Arc<ActiveOperation<ServerOperation>>,
        connection: &Connection,
        request: ExecuteRequest,
    ) -> Self {
        let op_id = active.id();
        let reporter = Arc::new(RemoteReporter {
            connection: connection.clone(),
            op_id,
        });
        let attachments = RemoteAttachment::all(connection, op_id, request.attachment_count)
            .into_iter()
            .map(|attachment| Arc::new(attachment) as Arc<dyn AttachmentSource>)
            .collect();
        let envelope = Envelope::new(request.operation)
            .with_message_handler(reporter.clone())
            .with_attachments(attachments);

        Self {
            active,
            envelope,
            reporter,
            identity: request.identity,
            in_vm: request.in_vm,
            prepared_by_engine: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.active.id()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The operation document
    pub fn operation(&self) -> &Value {
        self.envelope.operation()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn in_vm(&self) -> bool {
        self.in_vm
    }

    /// Send a progress message to the client's handler
    pub fn report(&self, severity: MessageSeverity, message: &str) -> Result<()> {
        self.reporter.report(severity, message)
    }

    /// Whether the client cancelled or went away
    ///
    /// Long-running engines should poll this before reaching prepare.
    pub fn is_cancelled(&self) -> bool {
        self.active.attachment().is_cancelled()
    }

    pub fn is_prepared(&self) -> bool {
        self.active.attachment().is_prepared()
    }

    /// Report the prepare point and wait for the client's decision
    ///
    /// Sends `Prepared` with `result`, blocks this thread until Complete
    /// arrives (or the operation is cancelled or the connection is lost),
    /// then commits or rolls back `transaction` and returns the decision
    /// that was applied. A failed commit is returned as the error.
    pub fn prepared(
        &mut self,
        transaction: Box<dyn EngineTransaction>,
        result: OperationOutcome,
    ) -> std::result::Result<Decision, EngineError> {
        self.prepared_by_engine = true;
        self.active.attachment().prepared(transaction, result)
    }

    pub(crate) fn prepared_by_engine(&self) -> bool {
        self.prepared_by_engine
    }
}
