use ledger_core::AccountId;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Failures inside the consumer pool
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    #[error("Account {requested} requested while holding account {held}")]
    NestedAccountLock { held: AccountId, requested: AccountId },

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

impl WorkerError {
    /// Failure that may succeed on redelivery
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Ledger(e) => e.is_transient(),
            WorkerError::Bus(_)
            | WorkerError::NestedAccountLock { .. }
            | WorkerError::Timeout(_) => true,
        }
    }
}

/// Errors returned to callers submitting commands
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Validation error: {0}")]
    Invalid(String),

    #[error("Account not found: {0}")]
    NotFound(AccountId),

    #[error("Account name already exists: {0}")]
    Conflict(String),

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientFunds { available: Decimal, requested: Decimal },

    #[error("Queue error: {0}")]
    Queue(#[from] message_bus::Error),

    #[error("Store error: {0}")]
    Store(ledger_core::Error),
}

impl From<ledger_core::Error> for IntakeError {
    fn from(err: ledger_core::Error) -> Self {
        match err {
            ledger_core::Error::NotFound(id) => IntakeError::NotFound(id),
            ledger_core::Error::DuplicateName(name) => IntakeError::Conflict(name),
            ledger_core::Error::InvalidAmount(reason) => IntakeError::Invalid(reason),
            ledger_core::Error::InsufficientFunds {
                balance, requested, ..
            } => IntakeError::InsufficientFunds {
                available: balance,
                requested: requested.abs(),
            },
            other => IntakeError::Store(other),
        }
    }
}

impl IntakeError {
    /// HTTP status a front end should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            IntakeError::Invalid(_) => 400,
            IntakeError::NotFound(_) => 404,
            IntakeError::Conflict(_) => 409,
            IntakeError::InsufficientFunds { .. } => 400,
            IntakeError::Queue(_) => 500,
            IntakeError::Store(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            IntakeError::Invalid(_) => "validation_error",
            IntakeError::NotFound(_) => "not_found",
            IntakeError::Conflict(_) => "duplicate_error",
            IntakeError::InsufficientFunds { .. } => "insufficient_balance",
            IntakeError::Queue(_) => "messaging_error",
            IntakeError::Store(_) => "database_error",
        }
    }
}
