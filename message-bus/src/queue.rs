//! Durable queue capability consumed by the ledger pipeline
//!
//! A queue hands out [`Delivery`] values. Each delivery must be settled
//! exactly once; a delivery that is dropped unsettled is treated by the
//! broker as a consumer disconnect and becomes eligible for redelivery.

use crate::{metrics::MESSAGE_SETTLE_TOTAL, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Final disposition of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; never redeliver
    Ack,
    /// Not processed; redeliver, optionally after a delay
    Nak(Option<Duration>),
    /// Unprocessable; never redeliver
    Term,
}

impl Settlement {
    /// Metric / log label
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Nak(_) => "nak",
            Settlement::Term => "term",
        }
    }
}

/// Broker-side handle used to settle one delivery
#[async_trait]
pub trait Acker: Send + Sync {
    /// Report the disposition of the delivery to the broker
    async fn settle(&self, settlement: Settlement) -> Result<()>;
}

/// One occurrence of a message arriving at a consumer
pub struct Delivery {
    payload: Bytes,
    attempt: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Create a delivery (used by queue implementations)
    pub fn new(payload: Bytes, attempt: u64, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            attempt,
            acker,
        }
    }

    /// Raw message body
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery attempt, starting at 1
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Settle the delivery, consuming it
    pub async fn settle(self, settlement: Settlement) -> Result<()> {
        let result = self.acker.settle(settlement).await;
        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_SETTLE_TOTAL
            .with_label_values(&[settlement.label(), status])
            .inc();
        result
    }

    /// Acknowledge: processed, remove from the queue
    pub async fn ack(self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    /// Negative acknowledgment: redeliver after `delay`
    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        self.settle(Settlement::Nak(delay)).await
    }

    /// Terminate: drop without redelivery
    pub async fn term(self) -> Result<()> {
        self.settle(Settlement::Term).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Stream of deliveries handed out by a queue
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// At-least-once FIFO broker with manual acknowledgment
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Durably enqueue a payload. `message_id` lets the broker drop
    /// re-publishes of the same message.
    async fn enqueue(&self, payload: Vec<u8>, message_id: &str) -> Result<()>;

    /// Open the delivery stream
    async fn consume(&self) -> Result<DeliveryStream>;
}
