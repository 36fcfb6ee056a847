//! Ledger Core
//!
//! Account and transaction model for the banking ledger, the queued command
//! encoding, and the store capabilities the mutation pipeline drives.
//!
//! # Invariants
//!
//! - Balance never negative: every mutation re-reads the balance under a row
//!   lock (or the store mutex) before applying
//! - Atomic apply: balance update and transaction row commit together
//! - Applied once: a command id maps to at most one transaction row
//! - Conservation: balance == Σ(transaction amounts) for every account

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod command;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

// Re-exports
pub use command::{Command, CommandEnvelope, DecodeError};
pub use error::{Error, Result};
pub use memory::{InMemoryAuditLog, InMemoryLedger};
pub use postgres::PgLedgerStore;
pub use store::{AuditStore, LedgerStore};
pub use types::{
    check_amount, Account, AccountId, AuditRecord, CommandId, LedgerTransaction,
    TransactionKind, AMOUNT_LIMIT, AMOUNT_SCALE,
};
