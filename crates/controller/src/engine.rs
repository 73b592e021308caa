//! Operation engine seam
//!
//! The engine executes one operation at a time per worker thread. When it
//! has validated and provisionally applied the operation it calls
//! `OperationContext::prepared` with a transaction handle; that call blocks
//! until the client decides, applies the decision to the handle and returns
//! it. Whatever the engine returns afterwards becomes the terminal result.

use crate::context::OperationContext;
use proven_common::OperationResponse;
use std::any::Any;
use thiserror::Error;

/// Executes management operations
///
/// Note: `execute` is synchronous and runs on a worker-pool thread, never
/// on an async task, because it blocks for the whole prepared phase.
pub trait OperationEngine: Send + Sync + 'static {
    /// Execute an operation
    ///
    /// An engine that returns a successful response without calling
    /// `prepared` is prepared by the controller with a `NoopTransaction`.
    fn execute(&self, ctx: &mut OperationContext) -> Result<OperationResponse, EngineError>;
}

/// Commit/rollback capability handed over at prepare time
pub trait EngineTransaction: Send {
    fn commit(self: Box<Self>) -> Result<(), EngineError>;

    fn rollback(self: Box<Self>);
}

/// Transaction for operations with nothing to undo
#[derive(Debug, Default)]
pub struct NoopTransaction;

impl EngineTransaction for NoopTransaction {
    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

/// Structured engine failure: the kind of error plus a description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: String,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an error together with its type name
    pub fn of<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(kind, error.to_string())
    }

    /// Convert a caught panic payload
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new("Panic", message)
    }
}
