//! The operation envelope exchanged between client and controller

use crate::attachment::{AttachmentSource, Attachments};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Severity of an out-of-band progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSeverity {
    Info,
    Warn,
    Error,
}

/// Receives progress and log messages emitted while an operation runs
pub trait MessageHandler: Send + Sync {
    fn handle_report(&self, severity: MessageSeverity, message: &str);
}

/// Caller identity forwarded with an Execute request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub roles: Vec<String>,
}

/// Immutable operation payload: the operation document, an optional handler
/// for out-of-band messages, and the attachment streams.
///
/// The attachment count is known up front; content is fetched lazily.
#[derive(Clone)]
pub struct Envelope {
    operation: Value,
    message_handler: Option<Arc<dyn MessageHandler>>,
    attachments: Attachments,
}

impl Envelope {
    /// Create an envelope with no handler and no attachments
    pub fn new(operation: Value) -> Self {
        Self {
            operation,
            message_handler: None,
            attachments: Vec::new(),
        }
    }

    /// Set the handler for progress messages
    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message_handler = Some(handler);
        self
    }

    /// Append one attachment
    pub fn with_attachment(mut self, attachment: Arc<dyn AttachmentSource>) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Replace the attachment list
    pub fn with_attachments(mut self, attachments: Attachments) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn operation(&self) -> &Value {
        &self.operation
    }

    pub fn message_handler(&self) -> Option<&Arc<dyn MessageHandler>> {
        self.message_handler.as_ref()
    }

    pub fn attachments(&self) -> &[Arc<dyn AttachmentSource>] {
        &self.attachments
    }

    /// Get an attachment by index
    pub fn attachment(&self, index: usize) -> Option<&Arc<dyn AttachmentSource>> {
        self.attachments.get(index)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("operation", &self.operation)
            .field("message_handler", &self.message_handler.is_some())
            .field("attachments", &self.attachments)
            .finish()
    }
}
