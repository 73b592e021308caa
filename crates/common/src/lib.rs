//! Common types for the two-phase management-operation protocol
//!
//! This crate defines:
//! - Operation identifiers shared by every message of one exchange
//! - The operation envelope (document, message handler, attachments)
//! - Outcome documents and terminal responses
//! - Attachment sources that are streamed lazily to the peer

mod attachment;
mod envelope;
mod operation_id;
mod outcome;

pub use attachment::{AttachmentSource, Attachments, BytesAttachment, FileAttachment};
pub use envelope::{Envelope, Identity, MessageHandler, MessageSeverity};
pub use operation_id::OperationId;
pub use outcome::{OperationOutcome, OperationResponse};
