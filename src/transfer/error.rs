//! Transfer Error Types

use thiserror::Error;

use super::types::{AccountId, TransactionId};

/// Transfer error types
///
/// `StateConflict`, `Store` and `Timeout` are retryable; the rest are final
/// for the attempt that produced them.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    // === Lookup Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    // === Protocol Errors ===
    #[error("State conflict on transaction {transaction_id}: {detail}")]
    StateConflict {
        transaction_id: TransactionId,
        detail: String,
    },

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Balance overflow on account {0}")]
    BalanceOverflow(AccountId),

    #[error("Transfer {transaction_id} failed: {cause}")]
    TransferFailed {
        transaction_id: TransactionId,
        #[source]
        cause: Box<TransferError>,
    },

    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    // === System Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store call timed out: {0}")]
    Timeout(&'static str),
}

impl TransferError {
    pub(crate) fn conflict(transaction_id: TransactionId, detail: impl Into<String>) -> Self {
        TransferError::StateConflict {
            transaction_id,
            detail: detail.into(),
        }
    }

    pub(crate) fn failed(transaction_id: TransactionId, cause: TransferError) -> Self {
        TransferError::TransferFailed {
            transaction_id,
            cause: Box::new(cause),
        }
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Validation(_) => "VALIDATION_ERROR",
            TransferError::NotFound(_) => "NOT_FOUND",
            TransferError::StateConflict { .. } => "STATE_CONFLICT",
            TransferError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            TransferError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            TransferError::TransferFailed { .. } => "TRANSFER_FAILED",
            TransferError::RollbackFailure(_) => "ROLLBACK_FAILURE",
            TransferError::Store(_) => "STORE_ERROR",
            TransferError::Timeout(_) => "TIMEOUT",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::StateConflict { .. }
            | TransferError::Store(_)
            | TransferError::Timeout(_) => true,
            TransferError::TransferFailed { cause, .. } => cause.is_retryable(),
            TransferError::Validation(_)
            | TransferError::NotFound(_)
            | TransferError::InsufficientFunds
            | TransferError::BalanceOverflow(_)
            | TransferError::RollbackFailure(_) => false,
        }
    }

    /// Innermost error, looking through `TransferFailed` wrappers
    pub fn root_cause(&self) -> &TransferError {
        match self {
            TransferError::TransferFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            TransferError::Validation("x".into()).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(TransferError::Timeout("find").code(), "TIMEOUT");
        assert_eq!(
            TransferError::BalanceOverflow(AccountId(7)).code(),
            "BALANCE_OVERFLOW"
        );
    }

    #[test]
    fn test_retryable() {
        let id = TransactionId::new();
        assert!(TransferError::conflict(id, "state moved").is_retryable());
        assert!(TransferError::Store("io".into()).is_retryable());
        assert!(!TransferError::InsufficientFunds.is_retryable());
        assert!(!TransferError::Validation("amount".into()).is_retryable());
        assert!(!TransferError::failed(id, TransferError::InsufficientFunds).is_retryable());
    }

    #[test]
    fn test_root_cause_unwraps_transfer_failed() {
        let id = TransactionId::new();
        let err = TransferError::failed(id, TransferError::InsufficientFunds);

        assert_eq!(err.code(), "TRANSFER_FAILED");
        assert!(matches!(err.root_cause(), TransferError::InsufficientFunds));
        assert!(err.to_string().ends_with("Insufficient funds"));
    }
}
