//! Protocol definitions for client-controller communication
//!
//! This crate defines typed request and response wrappers around the generic
//! `Message` type from proven-channel, the `Connection` that correlates
//! responses with requests and dispatches inbound requests, and the
//! attachment proxies that stream binary payloads over the same channel.

use proven_channel::ChannelError;
use thiserror::Error;

pub mod attachment;
pub mod connection;
pub mod messages;
pub mod responses;

pub use attachment::{AttachmentReader, AttachmentTable, RemoteAttachment};
pub use connection::{Connection, RequestContext, RequestHandler, ResponseSink, ResponseStream};
pub use messages::{Decision, ExecuteRequest, ManagementRequest, RequestType};
pub use responses::{ManagementResponse, ResponseType};

/// Protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub(crate) fn encode_body<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body)
        .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    Ok(body)
}

pub(crate) fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    ciborium::from_reader(body).map_err(|e| ProtocolError::Encoding(e.to_string()))
}
