//! Server side of the two-phase management-operation protocol
//!
//! The controller runs each Execute request on an explicitly owned worker
//! pool. When the engine reaches its prepare point the controller answers
//! `Prepared` and parks the engine's thread until the client's Complete
//! request decides between commit and rollback; the terminal response goes
//! out on the Complete request.
//!
//! All transitions of one operation happen under a single lock on its
//! coordinator state, which also covers the races between a Complete that
//! overtakes its Execute, a cancellation that arrives before prepare, and a
//! terminal result that is ready before the Complete that should carry it.

pub mod config;
pub mod context;
pub mod controller;
pub mod engine;
mod latch;
mod operation;
mod state;

pub use config::ControllerConfig;
pub use context::OperationContext;
pub use controller::ManagementController;
pub use engine::{EngineError, EngineTransaction, NoopTransaction, OperationEngine};
pub use state::Phase;

use proven_channel::ChannelError;
use proven_protocol::ProtocolError;
use thiserror::Error;

/// Controller errors
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
