//! Framed message channel for the management-operation protocol
//!
//! This crate provides the transport the protocol runs on:
//! - `Message`: a body plus string headers, framed on the wire as
//!   length-prefixed CBOR
//! - `Channel`: one end of a bidirectional connection over any
//!   `AsyncRead + AsyncWrite`, with a dedicated writer task
//! - `ActiveOperationRegistry`: atomic create-if-absent bookkeeping for
//!   in-flight operations
//! - `WorkerPool`: an explicitly owned pool of OS threads for work that
//!   must not run on async I/O tasks

use proven_common::OperationId;
use thiserror::Error;

pub mod channel;
pub mod codec;
pub mod executor;
pub mod message;
pub mod registry;

pub use channel::{Channel, ChannelConfig, MessageReceiver};
pub use executor::WorkerPool;
pub use message::{Message, MessageKind};
pub use registry::{ActiveOperation, ActiveOperationRegistry, AlreadyRegistered};

/// Channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Operation {0} is already registered")]
    AlreadyRegistered(OperationId),

    #[error("Worker pool is shut down")]
    PoolShutdown,
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
