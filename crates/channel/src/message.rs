//! Message format carried by the channel
//!
//! Every message has a body and string headers. The protocol layer stores
//! the operation id, request id, message kind and message type in headers.

use proven_common::OperationId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header holding the operation id
pub const OP_ID: &str = "op_id";
/// Header holding the per-connection request id
pub const REQUEST_ID: &str = "request_id";
/// Header distinguishing requests from responses
pub const MSG_KIND: &str = "msg_kind";
/// Header holding the request or response type
pub const MSG_TYPE: &str = "msg_type";

/// Whether a message starts an exchange or answers one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// Message that flows through a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message body (serialized data)
    pub body: Vec<u8>,

    /// Headers for metadata
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Create a new message with body and headers
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// Create a message with just body
    pub fn with_body(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get header value
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn op_id(&self) -> Option<OperationId> {
        self.get_header(OP_ID)
            .and_then(|s| OperationId::parse(s).ok())
    }

    pub fn request_id(&self) -> Option<u64> {
        self.get_header(REQUEST_ID).and_then(|s| s.parse().ok())
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.get_header(MSG_KIND).and_then(MessageKind::parse)
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get_header(MSG_TYPE)
    }
}

impl From<Vec<u8>> for Message {
    fn from(body: Vec<u8>) -> Self {
        Message::with_body(body)
    }
}
