//! Error types for the ledger

use crate::types::{AccountId, CommandId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account name already taken
    #[error("Account name already exists: {0}")]
    DuplicateName(String),

    /// Account does not exist
    #[error("Account not found: {0}")]
    NotFound(AccountId),

    /// Mutation would drive the balance negative
    #[error("Insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Account
        account_id: AccountId,
        /// Balance at apply time
        balance: Decimal,
        /// Signed amount requested
        requested: Decimal,
    },

    /// Amount or kind not acceptable for the operation
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// A transaction for this command id was already committed
    #[error("Command already applied: {0}")]
    AlreadyApplied(CommandId),

    /// Database error (PostgreSQL)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store unreachable or timed out
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Failure that may succeed on redelivery
    ///
    /// Database errors count only when the connection, pool or server state
    /// was at fault; anything else fails the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::Database(err) => is_transient_database_error(err),
            _ => false,
        }
    }

    /// Valid command, invalid against current state; terminal for the delivery
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            Error::DuplicateName(_)
                | Error::NotFound(_)
                | Error::InsufficientFunds { .. }
                | Error::InvalidAmount(_)
        )
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Error::DuplicateName(_) => "duplicate_name",
            Error::NotFound(_) => "not_found",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::AlreadyApplied(_) => "already_applied",
            Error::Database(_) => "database",
            Error::Unavailable(_) => "unavailable",
            Error::Serialization(_) => "serialization",
        }
    }
}

fn is_transient_database_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().map_or(false, |code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

/// SQLSTATE classes worth retrying
///
/// 08 connection exception, 40 transaction rollback (serialization failure,
/// deadlock), 53 insufficient resources, 57 operator intervention (admin
/// shutdown, query canceled), plus 55P03 lock not available.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code.get(..2), Some("08" | "40" | "53" | "57")) || code == "55P03"
}
