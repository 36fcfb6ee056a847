//! Store capabilities consumed by the mutation pipeline

use crate::{
    types::{
        check_amount, Account, AccountId, AuditRecord, CommandId, LedgerTransaction,
        TransactionKind, AMOUNT_LIMIT,
    },
    Error, Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Authoritative account / transaction store.
///
/// Every mutating call is atomic: either the balance update and its
/// transaction row both commit, or nothing does. A command id is applied at
/// most once; a second attempt fails with `Error::AlreadyApplied`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an account and record its `account_creation` transaction.
    ///
    /// Fails with `DuplicateName` if the name is taken.
    async fn create_account(
        &self,
        name: &str,
        initial_balance: Decimal,
        command_id: CommandId,
    ) -> Result<Account>;

    /// Fetch an account; fails with `NotFound`
    async fn get_account(&self, id: AccountId) -> Result<Account>;

    /// Look an account up by its unique name
    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>>;

    /// Re-read the balance, validate, update it and insert the transaction row.
    ///
    /// Fails with `NotFound`, `InsufficientFunds` if `balance + amount < 0`,
    /// or `AlreadyApplied` if `command_id` was committed before.
    async fn apply_mutation(
        &self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> Result<LedgerTransaction>;

    /// Transactions of an account in commit order
    async fn transactions(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>>;
}

/// Best-effort, non-authoritative mirror of applied mutations
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Opening balance check shared by every `create_account` implementation
pub(crate) fn check_opening_balance(balance: Decimal) -> Result<()> {
    if balance < Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "opening balance {} is negative",
            balance
        )));
    }
    check_amount(balance).map_err(Error::InvalidAmount)
}

/// Checks shared by every `apply_mutation` implementation
pub(crate) fn check_mutation(amount: Decimal, kind: TransactionKind) -> Result<()> {
    if kind == TransactionKind::AccountCreation {
        return Err(Error::InvalidAmount(
            "account_creation is not a balance mutation".to_string(),
        ));
    }
    if amount.is_zero() {
        return Err(Error::InvalidAmount("amount must be non-zero".to_string()));
    }
    if kind.signed(amount) != amount {
        return Err(Error::InvalidAmount(format!(
            "{} amount {} has the wrong sign",
            kind, amount
        )));
    }
    check_amount(amount).map_err(Error::InvalidAmount)
}

/// Balance after applying `amount`
///
/// `InsufficientFunds` below zero, `InvalidAmount` at or past `AMOUNT_LIMIT`.
pub(crate) fn checked_balance(account: &Account, amount: Decimal) -> Result<Decimal> {
    let new_balance = account
        .balance
        .checked_add(amount)
        .filter(|balance| *balance < AMOUNT_LIMIT)
        .ok_or_else(|| {
            Error::InvalidAmount(format!(
                "balance {} of account {} cannot take {}",
                account.balance, account.id, amount
            ))
        })?;
    if new_balance < Decimal::ZERO {
        return Err(Error::InsufficientFunds {
            account_id: account.id,
            balance: account.balance,
            requested: amount,
        });
    }
    Ok(new_balance)
}
