//! PostgreSQL ledger store
//!
//! Schema: `migrations/0001_ledger.sql`. Every mutation runs in one database
//! transaction; the account row is locked with `SELECT … FOR UPDATE` before
//! the balance check, and `transactions.command_id` is unique, so a command
//! can never be applied twice.

use crate::{
    error::{Error, Result},
    store::{check_mutation, check_opening_balance, checked_balance, LedgerStore},
    types::{Account, AccountId, CommandId, LedgerTransaction, TransactionKind},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";
const CHECK_VIOLATION: &str = "23514";
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
const ACCOUNTS_NAME_KEY: &str = "accounts_name_key";
const TRANSACTIONS_COMMAND_ID_KEY: &str = "transactions_command_id_key";

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    account_id: AccountId,
    amount: Decimal,
    kind: String,
    command_id: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let kind = row
            .kind
            .parse::<TransactionKind>()
            .map_err(|e| Error::Database(sqlx::Error::Decode(e.into())))?;

        Ok(LedgerTransaction {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            kind,
            command_id: row.command_id,
            created_at: row.created_at,
        })
    }
}

/// Map constraint and range violations to their business meaning
fn map_violation(err: sqlx::Error, name: &str, command_id: CommandId) -> Error {
    if let sqlx::Error::Database(db) = &err {
        match (db.code().as_deref(), db.constraint()) {
            (Some(UNIQUE_VIOLATION), Some(ACCOUNTS_NAME_KEY)) => {
                return Error::DuplicateName(name.to_string())
            }
            (Some(UNIQUE_VIOLATION), Some(TRANSACTIONS_COMMAND_ID_KEY)) => {
                return Error::AlreadyApplied(command_id)
            }
            (Some(CHECK_VIOLATION | NUMERIC_VALUE_OUT_OF_RANGE), _) => {
                return Error::InvalidAmount(db.message().to_string())
            }
            _ => {}
        }
    }
    Error::Database(err)
}

/// Ledger store on a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a pool
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL (max_connections: {})", max_connections);

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn command_applied(
        conn: &mut sqlx::PgConnection,
        command_id: CommandId,
    ) -> Result<bool> {
        let applied: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM transactions WHERE command_id = $1)")
                .bind(command_id)
                .fetch_one(conn)
                .await?;
        Ok(applied)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(
        &self,
        name: &str,
        initial_balance: Decimal,
        command_id: CommandId,
    ) -> Result<Account> {
        check_opening_balance(initial_balance)?;

        let mut tx = self.pool.begin().await?;

        if Self::command_applied(&mut tx, command_id).await? {
            return Err(Error::AlreadyApplied(command_id));
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM accounts WHERE name = $1)")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;
        if exists {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (name, balance)
            VALUES ($1, $2)
            RETURNING id, name, balance, created_at
            "#,
        )
        .bind(name)
        .bind(initial_balance)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_violation(e, name, command_id))?;

        // Same commit time as the account row, so the audit record can use it.
        sqlx::query(
            r#"
            INSERT INTO transactions (account_id, amount, type, command_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account.id)
        .bind(initial_balance)
        .bind(TransactionKind::AccountCreation.as_str())
        .bind(command_id)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_violation(e, name, command_id))?;

        tx.commit().await?;

        debug!(account_id = %account.id, name, "Account created");
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        sqlx::query_as::<_, Account>(
            "SELECT id, name, balance, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound(id))
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, name, balance, created_at FROM accounts WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn apply_mutation(
        &self,
        account_id: AccountId,
        amount: Decimal,
        kind: TransactionKind,
        command_id: CommandId,
    ) -> Result<LedgerTransaction> {
        check_mutation(amount, kind)?;

        let mut tx = self.pool.begin().await?;

        if Self::command_applied(&mut tx, command_id).await? {
            return Err(Error::AlreadyApplied(command_id));
        }

        let account = sqlx::query_as::<_, Account>(
            "SELECT id, name, balance, created_at FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::NotFound(account_id))?;

        let new_balance = checked_balance(&account, amount)?;

        sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(new_balance)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_violation(e, &account.name, command_id))?;

        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            INSERT INTO transactions (account_id, amount, type, command_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, account_id, amount, type AS kind, command_id, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .bind(kind.as_str())
        .bind(command_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_violation(e, &account.name, command_id))?;

        tx.commit().await?;

        debug!(
            account_id = %account_id,
            %kind,
            %amount,
            balance = %new_balance,
            "Mutation committed"
        );
        row.try_into()
    }

    async fn transactions(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, amount, type AS kind, command_id, created_at
            FROM transactions
            WHERE account_id = $1
            ORDER BY id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerTransaction::try_from).collect()
    }
}
