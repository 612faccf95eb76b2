//! Error Types

use thiserror::Error;

use crate::model::{AccountId, EntryId};

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger error types
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Balance too low for the requested debit
    #[error("Insufficient credits for {account}: balance {balance}, required {required}")]
    InsufficientCredits {
        account: AccountId,
        balance: i64,
        required: i64,
    },

    /// A uniqueness constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account was deactivated
    #[error("Account inactive: {0}")]
    AccountInactive(AccountId),

    /// Amount has the wrong sign for its kind, or is zero
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Storage is busy or locked; the operation may succeed if retried
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Permanent storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientCredits { balance, required, .. } => format!(
                "Not enough credits: this action costs {required} and your balance is {balance}."
            ),
            Self::AccountNotFound(_) => "Account not found.".into(),
            Self::AccountInactive(_) => "This account has been deactivated.".into(),
            Self::InvalidAmount(msg) => format!("Invalid amount: {msg}"),
            Self::TransientStorage(_) => "The ledger is busy. Please try again.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Self::TransientStorage(err.to_string())
                }
                ErrorCode::ConstraintViolation
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    Self::ConstraintViolation(err.to_string())
                }
                _ => Self::Storage(err.to_string()),
            },
            _ => Self::Storage(err.to_string()),
        }
    }
}

/// Errors from [`crate::gate::ExecutionGate::reserve_and_execute`]
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The debit was never written
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The action failed and its debit was refunded
    #[error("Action failed (debit {debit_id} refunded by {refund_id}): {cause}")]
    ActionFailed {
        debit_id: EntryId,
        refund_id: EntryId,
        cause: anyhow::Error,
    },

    /// The action failed and the refund could not be written
    #[error("Action failed and refund of debit {debit_id} could not be recorded: {refund_error}")]
    RefundFailed {
        debit_id: EntryId,
        cause: anyhow::Error,
        refund_error: LedgerError,
    },
}

impl ExecutionError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Ledger(e) => e.user_message(),
            Self::ActionFailed { .. } => {
                "The action failed. Your credits have been refunded.".into()
            }
            Self::RefundFailed { .. } => {
                "The action failed and the refund is pending review.".into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_message() {
        let err = LedgerError::InsufficientCredits {
            account: AccountId::from_string("acct_1"),
            balance: 10,
            required: 15,
        };
        let msg = err.user_message();
        assert!(msg.contains("15"));
        assert!(msg.contains("10"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_sqlite_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(LedgerError::from(err).is_retryable());
    }
}
