// Consumer pool - applies queued ledger commands
//
// A dispatcher task pulls deliveries off the queue into a bounded channel;
// `pool_size` workers take them from there. Every delivery is decoded,
// routed, applied under its account lock, mirrored to the audit store and
// finally settled:
//
//   decode failure          -> term
//   applied / rejected      -> ack
//   already applied         -> ack (no audit record)
//   transient failure       -> nak, redelivered after `redelivery_delay`

use crate::errors::{Result, WorkerError};
use crate::metrics::{AUDIT_MIRROR_FAILURES, COMMANDS_TOTAL, COMMAND_APPLY_DURATION};
use crate::serializer::AccountSerializer;
use futures::StreamExt;
use ledger_core::{
    Account, AuditRecord, AuditStore, Command, CommandEnvelope, CommandId, DecodeError,
    LedgerStore, LedgerTransaction,
};
use message_bus::{Delivery, DurableQueue, Settlement};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of worker tasks
    pub pool_size: usize,
    /// Deliveries buffered between dispatcher and workers
    pub channel_capacity: usize,
    /// Upper bound for a single store call
    pub store_timeout: Duration,
    /// Delay before a nak'ed delivery is redelivered
    pub redelivery_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            channel_capacity: 64,
            store_timeout: Duration::from_secs(5),
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

/// Result of processing one payload
#[derive(Debug)]
pub enum Outcome {
    /// Account opened
    Created(Account),
    /// Balance mutation committed
    Applied(LedgerTransaction),
    /// Command committed by an earlier delivery
    Replayed(CommandId),
    /// Valid command refused by the store
    Rejected(ledger_core::Error),
    /// Payload could not be decoded
    Dropped(DecodeError),
    /// Transient failure; try again later
    Retry(String),
}

impl Outcome {
    pub fn settlement(&self, redelivery_delay: Duration) -> Settlement {
        match self {
            Outcome::Created(_)
            | Outcome::Applied(_)
            | Outcome::Replayed(_)
            | Outcome::Rejected(_) => Settlement::Ack,
            Outcome::Dropped(_) => Settlement::Term,
            Outcome::Retry(_) => Settlement::Nak(Some(redelivery_delay)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created(_) => "created",
            Outcome::Applied(_) => "applied",
            Outcome::Replayed(_) => "replayed",
            Outcome::Rejected(_) => "rejected",
            Outcome::Dropped(_) => "dropped",
            Outcome::Retry(_) => "retry",
        }
    }
}

pub struct ConsumerPool {
    queue: Arc<dyn DurableQueue>,
    ledger: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditStore>,
    serializer: AccountSerializer,
    config: ConsumerConfig,
}

impl ConsumerPool {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        ledger: Arc<dyn LedgerStore>,
        audit: Arc<dyn AuditStore>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            audit,
            serializer: AccountSerializer::new(),
            config,
        }
    }

    pub fn serializer(&self) -> &AccountSerializer {
        &self.serializer
    }

    /// Open the delivery stream and start the dispatcher and workers
    pub async fn spawn(self) -> Result<PoolHandle> {
        let pool = Arc::new(self);
        let mut deliveries = pool.queue.consume().await?;

        let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(pool.config.channel_capacity);
        let delivery_rx = Arc::new(Mutex::new(delivery_rx));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        info!("Dispatcher stopping, no more deliveries will be pulled");
                        break;
                    }

                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            if delivery_tx.send(delivery).await.is_err() {
                                warn!("All workers gone, dispatcher stopping");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Failed to receive delivery: {}", e);
                        }
                        None => {
                            info!("Delivery stream ended");
                            break;
                        }
                    }
                }
            }
        });

        let workers = (0..pool.config.pool_size)
            .map(|worker_id| {
                let pool = Arc::clone(&pool);
                let delivery_rx = Arc::clone(&delivery_rx);
                tokio::spawn(async move {
                    loop {
                        let next = delivery_rx.lock().await.recv().await;
                        let Some(delivery) = next else { break };
                        pool.handle(worker_id, delivery).await;
                    }
                    debug!(worker_id, "Worker stopped");
                })
            })
            .collect();

        info!(
            pool_size = pool.config.pool_size,
            channel_capacity = pool.config.channel_capacity,
            "Consumer pool started"
        );

        Ok(PoolHandle {
            shutdown: ShutdownSignal(Arc::new(shutdown_tx)),
            dispatcher,
            workers,
        })
    }

    async fn handle(&self, worker_id: usize, delivery: Delivery) {
        let attempt = delivery.attempt();
        let outcome = self.process(delivery.payload()).await;
        let settlement = outcome.settlement(self.config.redelivery_delay);

        debug!(
            worker_id,
            attempt,
            outcome = outcome.label(),
            settlement = settlement.label(),
            "Settling delivery"
        );

        if let Err(e) = delivery.settle(settlement).await {
            // Unsettled deliveries come back after ack_wait.
            error!(worker_id, attempt, "Failed to settle delivery: {}", e);
        }
    }

    /// Decode, route, apply and mirror one payload
    pub async fn process(&self, payload: &[u8]) -> Outcome {
        let envelope = match CommandEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(reason = e.label(), "Dropping undecodable command: {}", e);
                COMMANDS_TOTAL.with_label_values(&["unknown", "dropped"]).inc();
                return Outcome::Dropped(e);
            }
        };

        let command_id = envelope.command_id;
        let kind = envelope.command.kind();

        let timer = COMMAND_APPLY_DURATION
            .with_label_values(&[kind.as_str()])
            .start_timer();
        let result = self.apply(&envelope).await;
        timer.observe_duration();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(WorkerError::Ledger(ledger_core::Error::AlreadyApplied(id))) => {
                info!(%command_id, %kind, "Command already applied, acknowledging replay");
                Outcome::Replayed(id)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    %command_id,
                    %kind,
                    "Transient failure, command will be redelivered: {}",
                    e
                );
                Outcome::Retry(e.to_string())
            }
            Err(WorkerError::Ledger(e)) if e.is_business_rejection() => {
                info!(%command_id, %kind, reason = e.label(), "Command rejected: {}", e);
                Outcome::Rejected(e)
            }
            Err(WorkerError::Ledger(e)) => {
                error!(%command_id, %kind, "Command failed permanently: {}", e);
                Outcome::Rejected(e)
            }
            Err(e) => {
                warn!(%command_id, %kind, "Command will be redelivered: {}", e);
                Outcome::Retry(e.to_string())
            }
        };

        match &outcome {
            Outcome::Created(account) => {
                info!(
                    %command_id,
                    account_id = %account.id,
                    name = %account.name,
                    "Account created"
                );
                self.mirror(AuditRecord::account_opened(account), command_id).await;
            }
            Outcome::Applied(tx) => {
                info!(
                    %command_id,
                    account_id = %tx.account_id,
                    %kind,
                    amount = %tx.amount,
                    "Mutation applied"
                );
                self.mirror(AuditRecord::from(tx), command_id).await;
            }
            _ => {}
        }

        COMMANDS_TOTAL
            .with_label_values(&[kind.as_str(), outcome.label()])
            .inc();
        outcome
    }

    async fn apply(&self, envelope: &CommandEnvelope) -> Result<Outcome> {
        let command_id = envelope.command_id;

        match &envelope.command {
            // Name uniqueness is enforced atomically by the store.
            Command::AccountCreation { name, balance } => {
                let account = self
                    .call_store(self.ledger.create_account(name, *balance, command_id))
                    .await?;
                Ok(Outcome::Created(account))
            }
            Command::Deposit { account_id, .. } | Command::Withdraw { account_id, .. } => {
                let account_id = *account_id;
                let amount = envelope.command.signed_amount();
                let kind = envelope.command.kind();

                let tx = self
                    .serializer
                    .with_account_lock(account_id, || {
                        self.call_store(
                            self.ledger
                                .apply_mutation(account_id, amount, kind, command_id),
                        )
                    })
                    .await??;
                Ok(Outcome::Applied(tx))
            }
        }
    }

    async fn call_store<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = ledger_core::Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WorkerError::Timeout(self.config.store_timeout)),
        }
    }

    async fn mirror(&self, record: AuditRecord, command_id: CommandId) {
        let result =
            tokio::time::timeout(self.config.store_timeout, self.audit.record(&record)).await;

        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.config.store_timeout),
        };

        AUDIT_MIRROR_FAILURES.inc();
        warn!(
            %command_id,
            account_id = %record.account_id,
            kind = %record.kind,
            "Audit mirror failed, ledger transaction kept: {}",
            failure
        );
    }
}

/// Stops the dispatcher from pulling further deliveries
#[derive(Clone)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Running consumer pool
pub struct PoolHandle {
    shutdown: ShutdownSignal,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Stop pulling, finish what was already dispatched, wait for the workers
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.join().await;
    }

    /// Wait until the delivery stream ends (or shutdown is signalled) and
    /// every worker has drained the channel
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Consumer pool stopped");
    }
}
