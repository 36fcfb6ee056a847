//! In-memory store implementations
//!
//! Same contract as the PostgreSQL store, held behind a single mutex. Used by
//! the test suites and for running the worker without a database. Failures
//! and latency can be injected to exercise the retry paths.

use crate::{
    error::{Error, Result},
    store::{check_mutation, check_opening_balance, checked_balance, AuditStore, LedgerStore},
    types::{Account, AccountId, AuditRecord, CommandId, LedgerTransaction, TransactionKind},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct LedgerState {
    last_account_id: i64,
    accounts: BTreeMap<AccountId, Account>,
    names: HashMap<String, AccountId>,
    transactions: Vec<LedgerTransaction>,
    applied: HashSet<CommandId>,
}

impl LedgerState {
    fn push_transaction(
        &mut self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> LedgerTransaction {
        let tx = LedgerTransaction {
            id: self.transactions.len() as i64 + 1,
            account_id,
            amount,
            kind,
            command_id,
            created_at: Utc::now(),
        };
        self.transactions.push(tx.clone());
        self.applied.insert(command_id);
        tx
    }
}

/// Ledger store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    failures: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` store calls with `Error::Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Delay every store call (before any state is touched)
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Every transaction row, in commit order
    pub fn all_transactions(&self) -> Vec<LedgerTransaction> {
        self.state.lock().transactions.clone()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Unavailable("injected store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_account(
        &self,
        name: &str,
        initial_balance: Decimal,
        command_id: CommandId,
    ) -> Result<Account> {
        self.enter().await?;
        check_opening_balance(initial_balance)?;

        let mut state = self.state.lock();
        if state.applied.contains(&command_id) {
            return Err(Error::AlreadyApplied(command_id));
        }
        if state.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        state.last_account_id += 1;
        let account_id = AccountId(state.last_account_id);
        let opening = state.push_transaction(
            account_id,
            initial_balance,
            TransactionKind::AccountCreation,
            command_id,
        );
        let account = Account {
            id: account_id,
            name: name.to_string(),
            balance: initial_balance,
            created_at: opening.created_at,
        };
        state.accounts.insert(account.id, account.clone());
        state.names.insert(account.name.clone(), account.id);

        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.enter().await?;
        self.state
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.enter().await?;
        let state = self.state.lock();
        Ok(state
            .names
            .get(name)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn apply_mutation(
        &self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> Result<LedgerTransaction> {
        check_mutation(amount, kind)?;
        self.enter().await?;

        let mut state = self.state.lock();
        if state.applied.contains(&command_id) {
            return Err(Error::AlreadyApplied(command_id));
        }

        let account = state
            .accounts
            .get(&account_id)
            .ok_or(Error::NotFound(account_id))?;
        let new_balance = checked_balance(account, amount)?;

        if let Some(account) = state.accounts.get_mut(&account_id) {
            account.balance = new_balance;
        }
        Ok(state.push_transaction(account_id, amount, kind, command_id))
    }

    async fn transactions(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>> {
        self.enter().await?;
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }
}

/// Audit mirror kept in process memory; can be switched off
#[derive(Debug)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryAuditLog {
    /// Empty, available log
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every `record` fails with `Error::Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Records appended so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("audit log offline".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
