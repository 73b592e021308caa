//! Typed request wrappers
//!
//! Each request travels as a `Message` whose `msg_type` header names the
//! request type. Small scalar fields are carried in headers; structured
//! payloads are CBOR bodies.

use crate::{ProtocolError, Result, decode_body, encode_body};
use proven_channel::Message;
use proven_channel::message::MSG_TYPE;
use proven_common::{Identity, MessageSeverity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DECISION: &str = "decision";
const ATTACHMENT_INDEX: &str = "attachment_index";

/// Commit or roll back a prepared operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    /// Parse from string header value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(Self::Commit),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }

    /// Convert to string header value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Request discriminator carried in the `msg_type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Execute,
    Complete,
    CancelAsync,
    GetAttachment,
    CloseAttachment,
    HandleReport,
}

impl RequestType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execute" => Some(Self::Execute),
            "complete" => Some(Self::Complete),
            "cancel_async" => Some(Self::CancelAsync),
            "get_attachment" => Some(Self::GetAttachment),
            "close_attachment" => Some(Self::CloseAttachment),
            "handle_report" => Some(Self::HandleReport),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Complete => "complete",
            Self::CancelAsync => "cancel_async",
            Self::GetAttachment => "get_attachment",
            Self::CloseAttachment => "close_attachment",
            Self::HandleReport => "handle_report",
        }
    }
}

/// Body of an Execute request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Opaque operation document
    pub operation: Value,
    /// Number of attachments the controller may fetch
    pub attachment_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub in_vm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReportBody {
    severity: MessageSeverity,
    message: String,
}

/// A typed protocol request
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementRequest {
    /// Run an operation up to its prepare point
    Execute(ExecuteRequest),
    /// Commit or roll back; before prepare this means cancel
    Complete { decision: Decision },
    /// Cancel whatever the operation is doing; answered with `RequestEnd`
    CancelAsync,
    /// Stream the attachment at `index` as `AttachmentData` chunks
    GetAttachment { index: u32 },
    /// Release the attachment stream at `index`
    CloseAttachment { index: u32 },
    /// Progress or log message for the envelope's message handler
    HandleReport {
        severity: MessageSeverity,
        message: String,
    },
}

impl ManagementRequest {
    pub fn request_type(&self) -> RequestType {
        match self {
            Self::Execute(_) => RequestType::Execute,
            Self::Complete { .. } => RequestType::Complete,
            Self::CancelAsync => RequestType::CancelAsync,
            Self::GetAttachment { .. } => RequestType::GetAttachment,
            Self::CloseAttachment { .. } => RequestType::CloseAttachment,
            Self::HandleReport { .. } => RequestType::HandleReport,
        }
    }

    /// Convert to a raw Message; routing headers are added by the connection
    pub fn into_message(self) -> Result<Message> {
        let request_type = self.request_type();
        let message = match self {
            Self::Execute(execute) => Message::with_body(encode_body(&execute)?),
            Self::Complete { decision } => {
                Message::with_body(Vec::new()).with_header(DECISION, decision.as_str())
            }
            Self::CancelAsync => Message::with_body(Vec::new()),
            Self::GetAttachment { index } | Self::CloseAttachment { index } => {
                Message::with_body(Vec::new()).with_header(ATTACHMENT_INDEX, index.to_string())
            }
            Self::HandleReport { severity, message } => {
                Message::with_body(encode_body(&ReportBody { severity, message })?)
            }
        };
        Ok(message.with_header(MSG_TYPE, request_type.as_str()))
    }

    /// Parse a raw Message into a typed request
    pub fn from_message(msg: &Message) -> Result<Self> {
        let type_str = msg
            .msg_type()
            .ok_or(ProtocolError::MissingHeader(MSG_TYPE))?;
        let request_type = RequestType::parse(type_str)
            .ok_or_else(|| ProtocolError::UnknownMessageType(type_str.to_string()))?;

        match request_type {
            RequestType::Execute => Ok(Self::Execute(decode_body(&msg.body)?)),
            RequestType::Complete => {
                let value = msg
                    .get_header(DECISION)
                    .ok_or(ProtocolError::MissingHeader(DECISION))?;
                let decision = Decision::parse(value).ok_or_else(|| ProtocolError::InvalidHeader {
                    name: DECISION,
                    value: value.to_string(),
                })?;
                Ok(Self::Complete { decision })
            }
            RequestType::CancelAsync => Ok(Self::CancelAsync),
            RequestType::GetAttachment => Ok(Self::GetAttachment {
                index: attachment_index(msg)?,
            }),
            RequestType::CloseAttachment => Ok(Self::CloseAttachment {
                index: attachment_index(msg)?,
            }),
            RequestType::HandleReport => {
                let body: ReportBody = decode_body(&msg.body)?;
                Ok(Self::HandleReport {
                    severity: body.severity,
                    message: body.message,
                })
            }
        }
    }
}

fn attachment_index(msg: &Message) -> Result<u32> {
    let value = msg
        .get_header(ATTACHMENT_INDEX)
        .ok_or(ProtocolError::MissingHeader(ATTACHMENT_INDEX))?;
    value.parse().map_err(|_| ProtocolError::InvalidHeader {
        name: ATTACHMENT_INDEX,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_carries_identity_and_attachment_count() {
        let request = ManagementRequest::Execute(ExecuteRequest {
            operation: json!({"operation": "add", "address": [{"subsystem": "logging"}]}),
            attachment_count: 2,
            identity: Some(Identity {
                user: "admin".to_string(),
                roles: vec!["SuperUser".to_string()],
            }),
            in_vm: true,
        });

        let msg = request.clone().into_message().unwrap();
        assert_eq!(msg.msg_type(), Some("execute"));
        assert_eq!(ManagementRequest::from_message(&msg).unwrap(), request);
    }

    #[test]
    fn test_complete_decision_lives_in_header() {
        let msg = ManagementRequest::Complete {
            decision: Decision::Rollback,
        }
        .into_message()
        .unwrap();

        assert!(msg.body.is_empty());
        assert_eq!(msg.get_header("decision"), Some("rollback"));
    }

    #[test]
    fn test_rejects_unknown_decision() {
        let msg = Message::with_body(Vec::new())
            .with_header(MSG_TYPE, "complete")
            .with_header(DECISION, "maybe");

        assert_eq!(
            ManagementRequest::from_message(&msg),
            Err(ProtocolError::InvalidHeader {
                name: "decision",
                value: "maybe".to_string()
            })
        );
    }

    #[test]
    fn test_rejects_unknown_request_type() {
        let msg = Message::with_body(Vec::new()).with_header(MSG_TYPE, "reboot");
        assert_eq!(
            ManagementRequest::from_message(&msg),
            Err(ProtocolError::UnknownMessageType("reboot".to_string()))
        );
    }

    #[test]
    fn test_attachment_index_must_be_numeric() {
        let msg = Message::with_body(Vec::new())
            .with_header(MSG_TYPE, "get_attachment")
            .with_header(ATTACHMENT_INDEX, "first");

        assert!(matches!(
            ManagementRequest::from_message(&msg),
            Err(ProtocolError::InvalidHeader { name: "attachment_index", .. })
        ));
    }
}
