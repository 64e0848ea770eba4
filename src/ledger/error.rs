//! Ledger Error Types
//!
//! One error enum for every ledger operation. Driver errors are classified by
//! SQLSTATE so callers can tell a conflict from a transient outage without
//! looking at the driver.

use std::fmt;

use thiserror::Error;

/// Why a transactional scope was abandoned before it could finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The per-request deadline elapsed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Ledger error types
#[derive(Error, Debug)]
pub enum LedgerError {
    // === Caller Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Insufficient funds on account {account_id}: balance would be {balance}")]
    InsufficientFunds { account_id: i64, balance: i64 },

    // === Store Errors ===
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Database error: {0}")]
    Database(String),

    // === Transaction Errors ===
    #[error("Commit failed: {0}")]
    CommitFailed(#[source] Box<LedgerError>),

    #[error("Transaction failed: {cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        cause: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    #[error("Transaction aborted: {0}")]
    Cancelled(CancelReason),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        LedgerError::NotFound { entity, id }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::Conflict(_) => "CONFLICT",
            LedgerError::TransientStore(_) => "TRANSIENT_STORE_ERROR",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::CommitFailed(_) | LedgerError::RollbackFailed { .. } => {
                "TRANSACTION_ERROR"
            }
            LedgerError::Cancelled(CancelReason::Cancelled) => "CANCELLED",
            LedgerError::Cancelled(CancelReason::DeadlineExceeded) => "DEADLINE_EXCEEDED",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// The ledger itself never retries. A failed commit is never retryable:
    /// the server may have committed before the connection broke, and a
    /// second attempt would apply the transfer twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::TransientStore(_)
                | LedgerError::Cancelled(CancelReason::DeadlineExceeded)
        )
    }

    /// True when the store may or may not have applied the writes.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, LedgerError::CommitFailed(_))
    }

    /// True for both commit and rollback failures.
    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            LedgerError::CommitFailed(_) | LedgerError::RollbackFailed { .. }
        )
    }
}

// SQLSTATE codes the ledger reacts to
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const NUMERIC_OUT_OF_RANGE: &str = "22003";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const QUERY_CANCELED: &str = "57014";

/// SQLSTATE of a driver error, if the server produced one.
pub(crate) fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    sqlstate(e).as_deref() == Some(FOREIGN_KEY_VIOLATION)
}

/// The server gave up on a statement: `lock_timeout`, `statement_timeout`
/// or `pg_cancel_backend`.
pub(crate) fn is_statement_timeout(e: &sqlx::Error) -> bool {
    matches!(
        sqlstate(e).as_deref(),
        Some(LOCK_NOT_AVAILABLE) | Some(QUERY_CANCELED)
    )
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(UNIQUE_VIOLATION) | Some(FOREIGN_KEY_VIOLATION) => {
                    LedgerError::Conflict(db.message().to_string())
                }
                Some(CHECK_VIOLATION) | Some(NUMERIC_OUT_OF_RANGE) => {
                    LedgerError::Validation(db.message().to_string())
                }
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
                    LedgerError::TransientStore(db.message().to_string())
                }
                Some(LOCK_NOT_AVAILABLE) | Some(QUERY_CANCELED) => {
                    LedgerError::Cancelled(CancelReason::DeadlineExceeded)
                }
                _ => LedgerError::Database(e.to_string()),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => LedgerError::TransientStore(e.to_string()),
            _ => LedgerError::Database(e.to_string()),
        }
    }
}
