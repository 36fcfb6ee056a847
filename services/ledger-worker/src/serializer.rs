//! Per-account mutual exclusion
//!
//! One async mutex per account id, created on first use and kept for the
//! life of the process. A task may hold a single account lock; asking for a
//! second one from inside the critical section is refused instead of risking
//! a lock-order deadlock.

use crate::errors::{Result, WorkerError};
use crate::metrics::SERIALIZER_TRACKED_ACCOUNTS;
use dashmap::DashMap;
use ledger_core::AccountId;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

tokio::task_local! {
    static HELD_ACCOUNT: AccountId;
}

/// Keyed lock table shared by all workers
#[derive(Debug, Clone, Default)]
pub struct AccountSerializer {
    locks: Arc<DashMap<AccountId, Arc<Mutex<()>>>>,
}

impl AccountSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `account_id`.
    ///
    /// Fails with [`WorkerError::NestedAccountLock`] when the calling task
    /// already holds an account lock.
    pub async fn with_account_lock<F, Fut, T>(&self, account_id: AccountId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Ok(held) = HELD_ACCOUNT.try_with(|held| *held) {
            return Err(WorkerError::NestedAccountLock {
                held,
                requested: account_id,
            });
        }

        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        Ok(HELD_ACCOUNT.scope(account_id, f()).await)
    }

    /// Number of accounts with a lock entry
    pub fn tracked_accounts(&self) -> usize {
        self.locks.len()
    }

    fn lock_for(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        // The map shard guard must not live across an await.
        let lock = self
            .locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        SERIALIZER_TRACKED_ACCOUNTS.set(self.locks.len() as i64);
        lock
    }
}
