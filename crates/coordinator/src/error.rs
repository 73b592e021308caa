//! Error types for the client side

use proven_common::OperationId;
use proven_protocol::ProtocolError;
use thiserror::Error;

/// Client error types
///
/// Cloneable because one error may be observed by every holder of an
/// `OperationFuture`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Controller reported an error: {0}")]
    Remote(String),

    #[error("Channel closed before operation {0} completed")]
    ChannelClosed(OperationId),

    #[error("A decision was already sent for operation {0}")]
    DecisionAlreadySent(OperationId),

    #[error("Operation {0} failed before it prepared")]
    NotPrepared(OperationId),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
