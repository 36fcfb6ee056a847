//! End-to-end pipeline tests on the in-memory queue and stores

use async_trait::async_trait;
use chrono::Utc;
use ledger_core::{
    Account, AccountId, Command, CommandEnvelope, CommandId, Error, InMemoryAuditLog,
    InMemoryLedger, LedgerStore, LedgerTransaction, TransactionKind,
};
use ledger_worker::{ConsumerConfig, ConsumerPool, Intake, PoolHandle};
use message_bus::{DurableQueue, InMemoryQueue};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    queue: InMemoryQueue,
    ledger: Arc<InMemoryLedger>,
    audit: Arc<InMemoryAuditLog>,
    intake: Intake,
}

fn harness() -> Harness {
    let queue = InMemoryQueue::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let intake = Intake::new(Arc::new(queue.clone()), ledger.clone());
    Harness {
        queue,
        ledger,
        audit,
        intake,
    }
}

async fn start(h: &Harness, pool_size: usize) -> PoolHandle {
    ConsumerPool::new(
        Arc::new(h.queue.clone()),
        h.ledger.clone(),
        h.audit.clone(),
        ConsumerConfig {
            pool_size,
            channel_capacity: 16,
            store_timeout: Duration::from_millis(500),
            redelivery_delay: Duration::from_millis(10),
        },
    )
    .spawn()
    .await
    .unwrap()
}

async fn settle(queue: &InMemoryQueue) {
    tokio::time::timeout(Duration::from_secs(5), queue.wait_until_idle())
        .await
        .expect("queue never went idle");
}

#[tokio::test]
async fn test_end_to_end_account_lifecycle() {
    let h = harness();
    let handle = start(&h, 4).await;

    h.intake
        .request_account_creation("Alice", dec!(100))
        .await
        .unwrap();
    settle(&h.queue).await;

    let alice = h.ledger.find_account_by_name("Alice").await.unwrap().unwrap();
    h.intake.request_deposit(alice.id, dec!(50)).await.unwrap();
    settle(&h.queue).await;
    h.intake.request_withdraw(alice.id, dec!(120)).await.unwrap();
    settle(&h.queue).await;

    handle.shutdown().await;

    let alice = h.ledger.get_account(alice.id).await.unwrap();
    assert_eq!(alice.balance, dec!(30));

    let txs = h.ledger.transactions(alice.id).await.unwrap();
    let amounts: Vec<Decimal> = txs.iter().map(|tx| tx.amount).collect();
    assert_eq!(amounts, vec![dec!(100), dec!(50), dec!(-120)]);

    let audit: Vec<(TransactionKind, Decimal)> = h
        .audit
        .records()
        .iter()
        .map(|record| (record.kind, record.amount))
        .collect();
    assert_eq!(
        audit,
        vec![
            (TransactionKind::AccountCreation, dec!(100)),
            (TransactionKind::Deposit, dec!(50)),
            (TransactionKind::Withdraw, dec!(120)),
        ]
    );
    assert_eq!(h.queue.acked(), 3);
}

#[tokio::test]
async fn test_concurrent_withdraws_never_overdraw() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Bob", dec!(100), Uuid::now_v7())
        .await
        .unwrap();

    // Each request passes the pre-check; only three can actually apply.
    for _ in 0..10 {
        h.intake.request_withdraw(account.id, dec!(30)).await.unwrap();
    }

    let handle = start(&h, 8).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    let account = h.ledger.get_account(account.id).await.unwrap();
    assert_eq!(account.balance, dec!(10));

    let withdrawals = h
        .ledger
        .transactions(account.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.kind == TransactionKind::Withdraw)
        .count();
    assert_eq!(withdrawals, 3);
    assert_eq!(h.audit.records().len(), 3);

    // Rejections are acknowledged, not retried.
    assert_eq!(h.queue.acked(), 10);
    assert_eq!(h.queue.nacked(), 0);
}

/// Store that reads the balance, yields, then writes it back.
///
/// Nothing inside the store orders two mutations of the same account, so
/// concurrent withdrawals only stay correct if the caller serializes them.
#[derive(Default)]
struct UnlockedLedger {
    accounts: Mutex<HashMap<AccountId, Account>>,
    transactions: Mutex<Vec<LedgerTransaction>>,
}

#[async_trait]
impl LedgerStore for UnlockedLedger {
    async fn create_account(
        &self,
        name: &str,
        initial_balance: Decimal,
        command_id: CommandId,
    ) -> ledger_core::Result<Account> {
        let mut accounts = self.accounts.lock();
        let account = Account {
            id: AccountId(accounts.len() as i64 + 1),
            name: name.to_string(),
            balance: initial_balance,
            created_at: Utc::now(),
        };
        accounts.insert(account.id, account.clone());
        drop(accounts);

        self.record(account.id, initial_balance, TransactionKind::AccountCreation, command_id);
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> ledger_core::Result<Account> {
        self.accounts
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn find_account_by_name(&self, name: &str) -> ledger_core::Result<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .values()
            .find(|account| account.name == name)
            .cloned())
    }

    async fn apply_mutation(
        &self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> ledger_core::Result<LedgerTransaction> {
        let account = self.get_account(account_id).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let new_balance = account.balance + amount;
        if new_balance < Decimal::ZERO {
            return Err(Error::InsufficientFunds {
                account_id,
                balance: account.balance,
                requested: amount,
            });
        }
        if let Some(stored) = self.accounts.lock().get_mut(&account_id) {
            stored.balance = new_balance;
        }
        Ok(self.record(account_id, amount, kind, command_id))
    }

    async fn transactions(
        &self,
        account_id: AccountId,
    ) -> ledger_core::Result<Vec<LedgerTransaction>> {
        Ok(self
            .transactions
            .lock()
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }
}

impl UnlockedLedger {
    fn record(
        &self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> LedgerTransaction {
        let mut transactions = self.transactions.lock();
        let tx = LedgerTransaction {
            id: transactions.len() as i64 + 1,
            account_id,
            amount,
            kind,
            command_id,
            created_at: Utc::now(),
        };
        transactions.push(tx.clone());
        tx
    }
}

#[tokio::test]
async fn test_account_lock_serializes_unlocked_store() {
    let queue = InMemoryQueue::new();
    let ledger = Arc::new(UnlockedLedger::default());
    let audit = Arc::new(InMemoryAuditLog::new());
    let intake = Intake::new(Arc::new(queue.clone()), ledger.clone());

    let account = ledger
        .create_account("Heidi", dec!(100), Uuid::now_v7())
        .await
        .unwrap();
    for _ in 0..10 {
        intake.request_withdraw(account.id, dec!(30)).await.unwrap();
    }

    let handle = ConsumerPool::new(
        Arc::new(queue.clone()),
        ledger.clone(),
        audit.clone(),
        ConsumerConfig {
            pool_size: 8,
            channel_capacity: 16,
            store_timeout: Duration::from_millis(500),
            redelivery_delay: Duration::from_millis(10),
        },
    )
    .spawn()
    .await
    .unwrap();
    settle(&queue).await;
    handle.shutdown().await;

    assert_eq!(ledger.get_account(account.id).await.unwrap().balance, dec!(10));

    let txs = ledger.transactions(account.id).await.unwrap();
    let withdrawn: Decimal = txs
        .iter()
        .filter(|tx| tx.kind == TransactionKind::Withdraw)
        .map(|tx| tx.amount)
        .sum();
    assert_eq!(withdrawn, dec!(-90));
    assert_eq!(audit.records().len(), 3);
    assert_eq!(queue.acked(), 10);
}

#[tokio::test]
async fn test_balance_limit_rejection_keeps_pool_running() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Ivan", dec!(9999999999999999), Uuid::now_v7())
        .await
        .unwrap();

    // Passes intake, fails at apply time.
    h.intake.request_deposit(account.id, dec!(5)).await.unwrap();
    h.intake.request_withdraw(account.id, dec!(1)).await.unwrap();

    let handle = start(&h, 2).await;
    settle(&h.queue).await;

    h.intake.request_withdraw(account.id, dec!(1)).await.unwrap();
    settle(&h.queue).await;
    handle.shutdown().await;

    assert_eq!(
        h.ledger.get_account(account.id).await.unwrap().balance,
        dec!(9999999999999997)
    );
    assert_eq!(h.queue.acked(), 3);
    assert_eq!(h.queue.nacked(), 0);
    assert_eq!(h.queue.pending(), 0);
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Carol", dec!(0), Uuid::now_v7())
        .await
        .unwrap();

    let envelope = CommandEnvelope::new(Command::Deposit {
        account_id: account.id,
        amount: dec!(25),
    });
    let payload = envelope.encode().unwrap();
    let message_id = envelope.command_id.to_string();
    h.queue.enqueue(payload.clone(), &message_id).await.unwrap();
    h.queue.enqueue(payload, &message_id).await.unwrap();

    let handle = start(&h, 2).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    assert_eq!(h.ledger.get_account(account.id).await.unwrap().balance, dec!(25));
    assert_eq!(h.ledger.transactions(account.id).await.unwrap().len(), 2);
    assert_eq!(h.audit.records().len(), 1);
    assert_eq!(h.queue.acked(), 2);
}

#[tokio::test]
async fn test_malformed_payloads_are_terminated() {
    let h = harness();
    h.queue
        .enqueue(br#"{"account_id": 1, "amount": 10}"#.to_vec(), "missing-type")
        .await
        .unwrap();
    h.queue
        .enqueue(
            br#"{"type": "transfer", "account_id": 1, "amount": 10}"#.to_vec(),
            "unknown-type",
        )
        .await
        .unwrap();
    h.queue
        .enqueue(b"not json at all".to_vec(), "garbage")
        .await
        .unwrap();

    let handle = start(&h, 2).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    assert_eq!(h.queue.terminated(), 3);
    assert_eq!(h.queue.acked(), 0);
    assert_eq!(h.queue.nacked(), 0);
    assert!(h.ledger.all_transactions().is_empty());
    assert!(h.audit.records().is_empty());
}

#[tokio::test]
async fn test_audit_outage_does_not_block_ledger() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Dave", dec!(10), Uuid::now_v7())
        .await
        .unwrap();
    h.audit.set_available(false);

    h.intake.request_deposit(account.id, dec!(5)).await.unwrap();

    let handle = start(&h, 1).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    assert_eq!(h.ledger.get_account(account.id).await.unwrap().balance, dec!(15));
    assert!(h.audit.records().is_empty());
    assert_eq!(h.queue.acked(), 1);
    assert_eq!(h.queue.nacked(), 0);
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_and_applied_once() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Erin", dec!(0), Uuid::now_v7())
        .await
        .unwrap();

    h.intake.request_deposit(account.id, dec!(40)).await.unwrap();
    h.ledger.fail_next(2);

    let handle = start(&h, 1).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    assert_eq!(h.queue.nacked(), 2);
    assert_eq!(h.queue.acked(), 1);
    assert_eq!(h.ledger.get_account(account.id).await.unwrap().balance, dec!(40));
    assert_eq!(h.ledger.transactions(account.id).await.unwrap().len(), 2);
    assert_eq!(h.audit.records().len(), 1);
}

#[tokio::test]
async fn test_duplicate_account_name_dropped() {
    let h = harness();
    h.ledger
        .create_account("Alice", dec!(100), Uuid::now_v7())
        .await
        .unwrap();

    // Bypass the intake pre-check, as a racing request would.
    let envelope = CommandEnvelope::new(Command::AccountCreation {
        name: "Alice".to_string(),
        balance: dec!(50),
    });
    h.queue
        .enqueue(envelope.encode().unwrap(), &envelope.command_id.to_string())
        .await
        .unwrap();

    let handle = start(&h, 1).await;
    settle(&h.queue).await;
    handle.shutdown().await;

    let alice = h.ledger.find_account_by_name("Alice").await.unwrap().unwrap();
    assert_eq!(alice.balance, dec!(100));
    assert_eq!(h.ledger.all_transactions().len(), 1);
    assert_eq!(h.queue.acked(), 1);
}

#[tokio::test]
async fn test_shutdown_leaves_nothing_in_flight() {
    let h = harness();
    let account = h
        .ledger
        .create_account("Frank", dec!(0), Uuid::now_v7())
        .await
        .unwrap();
    h.ledger.set_latency(Some(Duration::from_millis(5)));

    for _ in 0..20 {
        h.intake.request_deposit(account.id, dec!(1)).await.unwrap();
    }

    let handle = start(&h, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.shutdown().await;

    assert_eq!(h.queue.in_flight(), 0);
    let applied = h.queue.acked();
    assert_eq!(applied as usize + h.queue.pending(), 20);

    h.ledger.set_latency(None);
    let balance = h.ledger.get_account(account.id).await.unwrap().balance;
    assert_eq!(balance, Decimal::from(applied));
}

#[tokio::test]
async fn test_join_returns_when_queue_closes() {
    let h = harness();
    let handle = start(&h, 2).await;

    h.intake
        .request_account_creation("Grace", dec!(1))
        .await
        .unwrap();
    settle(&h.queue).await;
    h.queue.close();

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pool did not stop after the queue closed");
    assert_eq!(h.queue.acked(), 1);
}
