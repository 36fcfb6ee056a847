//! Core types for the ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Stable wire names (snake_case kinds shared by queue, database and audit log)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Idempotency key attached to every queued command
pub type CommandId = Uuid;

/// Fractional digits a stored amount may carry (`NUMERIC(20, 4)`)
pub const AMOUNT_SCALE: u32 = 4;

/// Exclusive upper bound on amounts and balances, 10^16
pub const AMOUNT_LIMIT: Decimal = Decimal::from_parts(1_874_919_424, 2_328_306, 0, false, 0);

/// Check that an amount fits the ledger's storage precision
///
/// The reason is returned as text so callers can wrap it in their own error.
pub fn check_amount(amount: Decimal) -> Result<(), String> {
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(format!(
            "amount {} has more than {} decimal places",
            amount, AMOUNT_SCALE
        ));
    }
    if amount.abs() >= AMOUNT_LIMIT {
        return Err(format!("amount {} must be below {}", amount, AMOUNT_LIMIT));
    }
    Ok(())
}

/// Store-assigned account identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Raw identifier value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Kind of ledger mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Account opened with an initial balance
    AccountCreation,
    /// Funds added
    Deposit,
    /// Funds removed
    Withdraw,
}

impl TransactionKind {
    /// Wire / database name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::AccountCreation => "account_creation",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
        }
    }

    /// Apply the kind's sign to an unsigned amount
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            TransactionKind::Withdraw => -amount.abs(),
            TransactionKind::AccountCreation | TransactionKind::Deposit => amount.abs(),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account_creation" => Ok(TransactionKind::AccountCreation),
            "deposit" => Ok(TransactionKind::Deposit),
            "withdraw" => Ok(TransactionKind::Withdraw),
            other => Err(format!("unknown transaction kind: {}", other)),
        }
    }
}

/// Bank account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    /// Store-assigned identifier
    pub id: AccountId,

    /// Unique display name
    pub name: String,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Commit time of the opening transaction
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one applied mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Store-assigned identifier
    pub id: i64,

    /// Account the mutation applied to
    pub account_id: AccountId,

    /// Signed amount (withdrawals negative)
    pub amount: Decimal,

    /// Mutation kind
    #[serde(rename = "type")]
    pub kind: TransactionKind,

    /// Command that produced this row
    pub command_id: CommandId,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,
}

/// Audit mirror document for an applied mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Account the mutation applied to
    pub account_id: AccountId,

    /// Unsigned amount as submitted
    pub amount: Decimal,

    /// Mutation kind
    #[serde(rename = "type")]
    pub kind: TransactionKind,

    /// Time the mutation was committed
    pub timestamp: DateTime<Utc>,
}

impl From<&LedgerTransaction> for AuditRecord {
    fn from(tx: &LedgerTransaction) -> Self {
        Self {
            account_id: tx.account_id,
            amount: tx.amount.abs(),
            kind: tx.kind,
            timestamp: tx.created_at,
        }
    }
}

impl AuditRecord {
    /// Record for a freshly opened account, stamped with its commit time
    pub fn account_opened(account: &Account) -> Self {
        Self {
            account_id: account.id,
            amount: account.balance,
            kind: TransactionKind::AccountCreation,
            timestamp: account.created_at,
        }
    }
}
