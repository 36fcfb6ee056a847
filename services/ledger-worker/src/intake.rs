//! Command intake
//!
//! Synchronous pre-checks a front end runs before a command is queued. They
//! give callers early feedback only; the worker re-validates everything at
//! apply time, so a command accepted here may still be rejected later.

use crate::errors::IntakeError;
use ledger_core::{Account, AccountId, Command, CommandEnvelope, CommandId, LedgerStore};
use message_bus::DurableQueue;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

type Result<T> = std::result::Result<T, IntakeError>;

/// Validates requests and enqueues them as commands
pub struct Intake {
    queue: Arc<dyn DurableQueue>,
    ledger: Arc<dyn LedgerStore>,
}

impl Intake {
    pub fn new(queue: Arc<dyn DurableQueue>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { queue, ledger }
    }

    /// Queue an account opening; the name must be free
    pub async fn request_account_creation(
        &self,
        name: &str,
        balance: Decimal,
    ) -> Result<CommandId> {
        let command = Command::AccountCreation {
            name: name.to_string(),
            balance,
        };
        Self::validate(&command)?;

        if self.ledger.find_account_by_name(name).await?.is_some() {
            return Err(IntakeError::Conflict(name.to_string()));
        }

        self.submit(command).await
    }

    pub async fn request_deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<CommandId> {
        let command = Command::Deposit { account_id, amount };
        Self::validate(&command)?;

        self.ledger.get_account(account_id).await?;
        self.submit(command).await
    }

    /// Queue a withdrawal if the current balance covers it
    pub async fn request_withdraw(
        &self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<CommandId> {
        let command = Command::Withdraw { account_id, amount };
        Self::validate(&command)?;

        let account = self.ledger.get_account(account_id).await?;
        if account.balance < amount {
            return Err(IntakeError::InsufficientFunds {
                available: account.balance,
                requested: amount,
            });
        }

        self.submit(command).await
    }

    pub async fn account_balance(&self, account_id: AccountId) -> Result<Account> {
        Ok(self.ledger.get_account(account_id).await?)
    }

    fn validate(command: &Command) -> Result<()> {
        command
            .validate()
            .map_err(|e| IntakeError::Invalid(e.to_string()))
    }

    async fn submit(&self, command: Command) -> Result<CommandId> {
        let envelope = CommandEnvelope::new(command);
        let payload = envelope.encode().map_err(message_bus::Error::from)?;

        self.queue
            .enqueue(payload, &envelope.command_id.to_string())
            .await?;

        info!(
            command_id = %envelope.command_id,
            kind = %envelope.command.kind(),
            "Command queued"
        );
        Ok(envelope.command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use ledger_core::InMemoryLedger;
    use message_bus::InMemoryQueue;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn intake() -> (Intake, InMemoryQueue, Arc<InMemoryLedger>) {
        let queue = InMemoryQueue::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let intake = Intake::new(Arc::new(queue.clone()), ledger.clone());
        (intake, queue, ledger)
    }

    #[tokio::test]
    async fn test_enqueues_encoded_command() {
        let (intake, queue, _) = intake();

        let command_id = intake
            .request_account_creation("Alice", dec!(100))
            .await
            .unwrap();
        assert_eq!(queue.pending(), 1);

        let mut deliveries = queue.consume().await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        let envelope = CommandEnvelope::decode(delivery.payload()).unwrap();
        assert_eq!(envelope.command_id, command_id);
        assert_eq!(
            envelope.command,
            Command::AccountCreation {
                name: "Alice".to_string(),
                balance: dec!(100),
            }
        );

        delivery.ack().await.unwrap();
        assert_eq!(queue.settled_ids(), vec![command_id.to_string()]);
    }

    #[tokio::test]
    async fn test_pre_checks() {
        let (intake, queue, ledger) = intake();
        let account = ledger
            .create_account("Bob", dec!(200), Uuid::now_v7())
            .await
            .unwrap();

        let duplicate = intake.request_account_creation("Bob", dec!(1)).await;
        assert_eq!(duplicate.unwrap_err().status_code(), 409);

        let blank = intake.request_account_creation("  ", dec!(1)).await;
        assert_eq!(blank.unwrap_err().status_code(), 400);

        let zero = intake.request_deposit(account.id, dec!(0)).await;
        assert!(matches!(zero, Err(IntakeError::Invalid(_))));

        let oversized = intake.request_deposit(account.id, Decimal::MAX).await;
        assert_eq!(oversized.unwrap_err().status_code(), 400);

        let too_precise = intake.request_withdraw(account.id, dec!(0.00001)).await;
        assert!(matches!(too_precise, Err(IntakeError::Invalid(_))));

        let missing = intake.request_deposit(AccountId(999), dec!(5)).await;
        assert_eq!(missing.unwrap_err().status_code(), 404);

        let overdraft = intake.request_withdraw(account.id, dec!(500)).await;
        assert!(matches!(
            overdraft,
            Err(IntakeError::InsufficientFunds { available, requested })
                if available == dec!(200) && requested == dec!(500)
        ));

        assert_eq!(queue.pending(), 0);

        intake.request_withdraw(account.id, dec!(200)).await.unwrap();
        assert_eq!(queue.pending(), 1);

        let balance = intake.account_balance(account.id).await.unwrap();
        assert_eq!(balance.balance, dec!(200));
    }
}
