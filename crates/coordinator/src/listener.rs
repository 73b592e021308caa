//! Callbacks for protocol events of one operation

use crate::transaction::PreparedTransaction;
use proven_common::{OperationOutcome, OperationResponse};

/// Receives the protocol events of one operation
///
/// Callbacks run on the connection's exchange task and must not block.
pub trait OperationListener: Send + Sync {
    /// The controller prepared the operation; exactly one of
    /// `transaction.commit()` or `transaction.rollback()` should follow.
    fn operation_prepared(&self, transaction: PreparedTransaction, result: OperationOutcome);

    /// The operation failed before it prepared; nothing else follows
    fn operation_failed(&self, result: OperationOutcome);

    /// The terminal response after commit or rollback
    fn operation_completed(&self, _response: &OperationResponse) {}
}
