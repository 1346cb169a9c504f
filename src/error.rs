//! Transaction manager error types.

use thiserror::Error;

use crate::resource::ResourceId;

/// A failure raised by a resource operation's `execute`.
///
/// The manager propagates this verbatim to the caller: the transaction is
/// not aborted and the resource's lock stays held, so the caller can retry,
/// apply a different operation, or roll back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource operation failed: {message}")]
pub struct ResourceOperationError {
    message: String,
}

impl ResourceOperationError {
    /// Creates an operation error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message supplied by the operation.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors that can occur in the transaction manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// The calling thread has no active transaction.
    #[error("no active transaction on the calling thread")]
    NoActiveTransaction,

    /// The calling thread already has an active transaction.
    #[error("another transaction is already active on the calling thread")]
    AnotherTransactionActive,

    /// The resource id is not under this manager's control.
    #[error("unknown resource id: {0}")]
    UnknownResourceId(ResourceId),

    /// The calling thread's transaction has been aborted; only rollback can
    /// succeed until then.
    #[error("active transaction aborted")]
    ActiveTransactionAborted,

    /// A pending lock acquisition was cancelled before the grant. Resource
    /// and transaction state are unchanged.
    #[error("lock acquisition cancelled")]
    Cancelled,

    /// An injected resource operation failed.
    #[error(transparent)]
    Operation(#[from] ResourceOperationError),
}

/// Result type for transaction manager operations.
pub type TxnResult<T> = Result<T, TxnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_message() {
        let err = ResourceOperationError::new("insufficient funds");
        assert_eq!(err.message(), "insufficient funds");
        assert_eq!(
            format!("{}", err),
            "resource operation failed: insufficient funds"
        );
    }

    #[test]
    fn test_unknown_resource_carries_id() {
        let err = TxnError::UnknownResourceId(ResourceId::new(7));
        assert_eq!(format!("{}", err), "unknown resource id: R7");
        assert!(matches!(err, TxnError::UnknownResourceId(rid) if rid == ResourceId::new(7)));
    }

    #[test]
    fn test_operation_error_converts() {
        let err: TxnError = ResourceOperationError::new("boom").into();
        assert_eq!(
            err,
            TxnError::Operation(ResourceOperationError::new("boom"))
        );
    }
}
