//! Client side of the two-phase management-operation protocol
//!
//! A `ManagementClient` sends an operation to the controller and drives the
//! exchange: the listener learns when the operation prepared (and gets a
//! `PreparedTransaction` to commit or roll back) or failed, and an
//! `OperationFuture` resolves exactly once with the terminal response.
//!
//! `execute_blocking` adapts the listener-based API for synchronous callers.

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod future;
pub mod listener;
pub mod transaction;

pub use blocking::{PendingPrepare, PreparedOperation, execute_blocking, execute_blocking_with};
pub use client::{ExecuteOptions, ManagementClient};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use future::OperationFuture;
pub use listener::OperationListener;
pub use transaction::PreparedTransaction;
