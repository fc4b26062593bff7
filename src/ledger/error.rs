//! Ledger Error Types
//!
//! Two layers: [`StoreError`] classifies what the storage backend reported,
//! [`TransferError`] is what callers of the executor and query paths see.

use thiserror::Error;

use super::state::TransferStatus;
use super::types::{AccountId, Amount, Currency, TransferId};

/// Malformed request. Detected without touching the store, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Source and destination account are the same ({0})")]
    SameAccount(AccountId),

    #[error("Amount must be greater than zero (got {0})")]
    NonPositiveAmount(Amount),

    #[error("Currency mismatch: {from} -> {to}")]
    CurrencyMismatch { from: Currency, to: Currency },

    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Account owner must not be empty")]
    EmptyOwner,

    #[error("Opening balance must not be negative (got {0})")]
    NegativeOpeningBalance(Amount),

    #[error("Idempotency key must be 1..=128 bytes")]
    InvalidIdempotencyKey,

    /// The key is already bound to a transfer with different accounts or amount
    #[error("Idempotency key {key} already used by transfer {transfer_id} with different details")]
    IdempotencyKeyReused { key: String, transfer_id: TransferId },

    #[error("Invalid page: limit={limit} offset={offset}")]
    InvalidPage { limit: i64, offset: i64 },
}

/// Storage backend failure, classified by whether retrying can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Lock wait timeout, serialization failure or deadlock victim. Retryable.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    /// Unique constraint (idempotency key, single reversal)
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The commit was sent but its acknowledgement never arrived. The unit
    /// may or may not be applied.
    #[error("Commit outcome unknown: {0}")]
    CommitUnknown(String),

    #[error("Database error: {0}")]
    Backend(String),
}

impl StoreError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available, query_canceled
                Some("40001") | Some("40P01") | Some("55P03") | Some("57014") => {
                    StoreError::Conflict(db.message().to_string())
                }
                Some("23505") => StoreError::Duplicate(db.message().to_string()),
                Some("23502") | Some("23503") | Some("23514") => {
                    StoreError::Constraint(db.message().to_string())
                }
                _ => StoreError::Backend(e.to_string()),
            },
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::Corrupt(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// How a caller should read a [`TransferError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself was invalid; resubmitting it unchanged will fail again
    InvalidRequest,
    /// The system could not process the request
    SystemFailure,
}

/// Caller-facing error
///
/// A transfer rejected by business rules (insufficient funds) is NOT an
/// error: it comes back as `Ok` with status `failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Amount,
        amount: Amount,
    },

    #[error("Transfer {transfer_id} is {status} and cannot be reversed")]
    NotReversible {
        transfer_id: TransferId,
        status: TransferStatus,
    },

    #[error("Transfer {transfer_id} was already reversed by transfer {reversal_id}")]
    AlreadyReversed {
        transfer_id: TransferId,
        reversal_id: TransferId,
    },

    #[error("Concurrency conflict moving {amount} from {from} to {to}: gave up after {attempts} attempts")]
    ConcurrencyConflict {
        from: AccountId,
        to: AccountId,
        amount: Amount,
        attempts: u32,
    },

    #[error("Persistence failure ({context}): {source}")]
    Persistence {
        context: String,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    pub fn persistence(context: impl Into<String>, source: StoreError) -> Self {
        TransferError::Persistence {
            context: context.into(),
            source,
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Validation(_) => "VALIDATION_ERROR",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::NotReversible { .. } => "NOT_REVERSIBLE",
            TransferError::AlreadyReversed { .. } => "ALREADY_REVERSED",
            TransferError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            TransferError::Persistence { .. } => "PERSISTENCE_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Validation(_)
            | TransferError::AccountNotFound(_)
            | TransferError::TransferNotFound(_)
            | TransferError::InsufficientFunds { .. }
            | TransferError::NotReversible { .. }
            | TransferError::AlreadyReversed { .. } => ErrorClass::InvalidRequest,
            TransferError::ConcurrencyConflict { .. } | TransferError::Persistence { .. } => {
                ErrorClass::SystemFailure
            }
        }
    }

    /// Whether the caller may resubmit the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TransferError::from(ValidationError::SameAccount(1)).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(TransferError::AccountNotFound(9).code(), "ACCOUNT_NOT_FOUND");
        assert_eq!(
            TransferError::persistence("x", StoreError::Unavailable("down".into())).code(),
            "PERSISTENCE_ERROR"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            TransferError::from(ValidationError::NonPositiveAmount(0)).class(),
            ErrorClass::InvalidRequest
        );
        assert_eq!(
            TransferError::AccountNotFound(1).class(),
            ErrorClass::InvalidRequest
        );
        let conflict = TransferError::ConcurrencyConflict {
            from: 1,
            to: 2,
            amount: 10,
            attempts: 5,
        };
        assert_eq!(conflict.class(), ErrorClass::SystemFailure);
        assert!(conflict.is_retryable());
        assert!(!TransferError::persistence("ctx", StoreError::Backend("x".into())).is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = TransferError::persistence(
            "transfer 1 -> 2 amount 300",
            StoreError::Unavailable("connection reset".into()),
        );
        let text = err.to_string();
        assert!(text.contains("transfer 1 -> 2 amount 300"));
        assert!(text.contains("connection reset"));

        let err = TransferError::InsufficientFunds {
            account_id: 7,
            balance: 100,
            amount: 300,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds in account 7: balance 100, requested 300"
        );
    }

    #[test]
    fn test_sqlx_classification() {
        assert_eq!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::NotFound(sqlx::Error::RowNotFound.to_string())
        );
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::ColumnNotFound("balance".into())),
            StoreError::Corrupt(_)
        ));
        assert!(StoreError::Conflict("x".into()).is_retryable());
        assert!(!StoreError::Unavailable("x".into()).is_retryable());
        assert!(!StoreError::CommitUnknown("x".into()).is_retryable());
    }

    #[test]
    fn test_reused_key_is_invalid_request() {
        let err = TransferError::from(ValidationError::IdempotencyKeyReused {
            key: "k".into(),
            transfer_id: 4,
        });
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.class(), ErrorClass::InvalidRequest);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("transfer 4"));
    }
}
