//! Queued command encoding
//!
//! Wire shape (JSON object, `type` is the tag):
//!
//! ```text
//! {"type":"account_creation","command_id":"…","issued_at":"…","name":"Alice","balance":"100"}
//! {"type":"deposit","command_id":"…","issued_at":"…","account_id":1,"amount":"50.25"}
//! {"type":"withdraw","command_id":"…","issued_at":"…","account_id":1,"amount":20}
//! ```
//!
//! Amounts are written as decimal strings and accepted as strings or JSON
//! numbers. Decoding validates exhaustively and never panics.

use crate::types::{check_amount, AccountId, CommandId, TransactionKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Ledger mutation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Open an account
    AccountCreation {
        /// Unique display name
        name: String,
        /// Opening balance
        balance: Decimal,
    },
    /// Add funds
    Deposit {
        /// Target account
        account_id: AccountId,
        /// Positive amount
        amount: Decimal,
    },
    /// Remove funds
    Withdraw {
        /// Target account
        account_id: AccountId,
        /// Positive amount
        amount: Decimal,
    },
}

impl Command {
    /// Mutation kind
    pub fn kind(&self) -> TransactionKind {
        match self {
            Command::AccountCreation { .. } => TransactionKind::AccountCreation,
            Command::Deposit { .. } => TransactionKind::Deposit,
            Command::Withdraw { .. } => TransactionKind::Withdraw,
        }
    }

    /// Target account (absent for creation)
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Command::AccountCreation { .. } => None,
            Command::Deposit { account_id, .. } | Command::Withdraw { account_id, .. } => {
                Some(*account_id)
            }
        }
    }

    /// Unsigned amount carried by the command
    pub fn amount(&self) -> Decimal {
        match self {
            Command::AccountCreation { balance, .. } => *balance,
            Command::Deposit { amount, .. } | Command::Withdraw { amount, .. } => *amount,
        }
    }

    /// Amount with the kind's sign applied
    pub fn signed_amount(&self) -> Decimal {
        self.kind().signed(self.amount())
    }

    /// Semantic checks a well-formed payload must still pass
    pub fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Command::AccountCreation { name, balance } => {
                if name.trim().is_empty() {
                    return Err(DecodeError::Invalid("account name is empty".to_string()));
                }
                if *balance < Decimal::ZERO {
                    return Err(DecodeError::Invalid(format!(
                        "opening balance {} is negative",
                        balance
                    )));
                }
            }
            Command::Deposit { amount, .. } | Command::Withdraw { amount, .. } => {
                if *amount <= Decimal::ZERO {
                    return Err(DecodeError::Invalid(format!(
                        "{} amount {} must be greater than zero",
                        self.kind(),
                        amount
                    )));
                }
            }
        }
        check_amount(self.amount()).map_err(DecodeError::Invalid)
    }
}

/// Command as carried on the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Idempotency key (UUIDv7)
    pub command_id: CommandId,

    /// Time the command was accepted at intake
    pub issued_at: DateTime<Utc>,

    /// The command itself
    #[serde(flatten)]
    pub command: Command,
}

/// Failure to turn a payload into a command; never retried
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or a field is missing or mistyped
    #[error("Malformed command payload: {0}")]
    Malformed(String),

    /// No string `type` field
    #[error("Command payload has no type")]
    MissingKind,

    /// `type` names no known command
    #[error("Unknown command type: {0}")]
    UnknownKind(String),

    /// Well-formed but semantically impossible
    #[error("Invalid command: {0}")]
    Invalid(String),
}

impl DecodeError {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingKind => "missing_kind",
            DecodeError::UnknownKind(_) => "unknown_kind",
            DecodeError::Invalid(_) => "invalid",
        }
    }
}

impl CommandEnvelope {
    /// Wrap a command with a fresh id and timestamp
    pub fn new(command: Command) -> Self {
        Self {
            command_id: Uuid::now_v7(),
            issued_at: Utc::now(),
            command,
        }
    }

    /// Serialize to the queue payload
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate a queue payload
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .ok_or(DecodeError::MissingKind)?;

        if kind.parse::<TransactionKind>().is_err() {
            return Err(DecodeError::UnknownKind(kind.to_string()));
        }

        let envelope: CommandEnvelope =
            serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        envelope.command.validate()?;

        Ok(envelope)
    }
}
