//! JetStream-backed durable queue
//!
//! Provides at-least-once delivery with:
//! - File-backed work-queue stream (messages removed once acked)
//! - Durable pull consumer with explicit acknowledgment
//! - Redelivery after `ack_wait` or on NAK, bounded by `max_deliver`
//! - Publish deduplication via `Nats-Msg-Id`
//! - Publish retry with exponential backoff

use async_nats::jetstream::{
    self,
    consumer::{self, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    metrics::{MESSAGE_PUBLISH_DURATION, MESSAGE_PUBLISH_TOTAL, MESSAGE_RECEIVE_TOTAL},
    queue::{Acker, Delivery, DeliveryStream, DurableQueue, Settlement},
    Error, Result,
};

/// JetStream queue configuration
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Stream name
    pub stream_name: String,

    /// Subject the commands are published on
    pub subject: String,

    /// Durable consumer name (shared by all worker processes)
    pub consumer_name: String,

    /// Time the broker waits for a settlement before redelivering
    pub ack_wait: Duration,

    /// Max delivery attempts (-1 for unlimited)
    pub max_deliver: i64,

    /// Window in which re-publishes of the same message id are dropped
    pub duplicate_window: Duration,

    /// Max publish attempts
    pub max_retry_attempts: u32,

    /// Initial publish retry delay
    pub initial_retry_delay: Duration,

    /// Max publish retry delay
    pub max_retry_delay: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: "LEDGER_COMMANDS".to_string(),
            subject: "ledger.commands".to_string(),
            consumer_name: "ledger-worker".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            duplicate_window: Duration::from_secs(120),
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Durable queue on a JetStream work-queue stream
pub struct JetStreamQueue {
    context: JetStreamContext,
    consumer: PullConsumer,
    config: JetStreamConfig,
}

impl JetStreamQueue {
    /// Connect to NATS and ensure stream and consumer exist
    pub async fn connect(nats_url: &str, config: JetStreamConfig) -> Result<Self> {
        info!("Connecting to NATS JetStream at {}", nats_url);

        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Self::with_client(client, config).await
    }

    /// Build the queue on an existing client connection
    pub async fn with_client(client: async_nats::Client, config: JetStreamConfig) -> Result<Self> {
        let context = jetstream::new(client);

        let stream_config = StreamConfig {
            name: config.stream_name.clone(),
            description: Some("Ledger mutation commands".to_string()),
            subjects: vec![config.subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            duplicate_window: config.duplicate_window,
            ..Default::default()
        };

        let stream = match context.get_or_create_stream(stream_config).await {
            Ok(stream) => {
                info!("Stream {} ready", config.stream_name);
                stream
            }
            Err(e) => {
                error!("Failed to create stream {}: {}", config.stream_name, e);
                return Err(Error::StreamCreation(e.to_string()));
            }
        };

        let consumer_config = consumer::pull::Config {
            durable_name: Some(config.consumer_name.clone()),
            description: Some("Ledger command consumer".to_string()),
            filter_subject: config.subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        };

        let consumer: PullConsumer = stream
            .get_or_create_consumer(&config.consumer_name, consumer_config)
            .await
            .map_err(|e| Error::ConsumerCreation(e.to_string()))?;

        info!(
            "Consumer {} ready on stream {} (ack_wait: {:?}, max_deliver: {})",
            config.consumer_name, config.stream_name, config.ack_wait, config.max_deliver
        );

        Ok(Self {
            context,
            consumer,
            config,
        })
    }

    /// Number of messages currently held by the stream
    pub async fn pending(&self) -> Result<u64> {
        let mut stream = self
            .context
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        Ok(info.state.messages)
    }

    /// Publish with exponential backoff retry
    async fn publish_with_retry(&self, payload: &[u8], message_id: &str) -> Result<()> {
        let mut attempts = 0;
        let mut delay = self.config.initial_retry_delay;

        loop {
            attempts += 1;

            match self.publish_once(payload, message_id).await {
                Ok(()) => {
                    if attempts > 1 {
                        info!("Message {} published after {} attempts", message_id, attempts);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempts >= self.config.max_retry_attempts {
                        error!(
                            "Failed to publish {} after {} attempts: {}",
                            message_id, attempts, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish of {} failed (attempt {}), retrying in {:?}: {}",
                        message_id, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;

                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
            }
        }
    }

    /// Single publish attempt, waits for the stream acknowledgment
    async fn publish_once(&self, payload: &[u8], message_id: &str) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message_id);

        let ack = self
            .context
            .publish_with_headers(
                self.config.subject.clone(),
                headers,
                Bytes::copy_from_slice(payload),
            )
            .await
            .map_err(|e| Error::Publish(e.to_string()))?
            .await
            .map_err(|e| Error::Publish(format!("Publish ack failed: {}", e)))?;

        if ack.duplicate {
            debug!("Duplicate publish of {} suppressed by stream", message_id);
        }

        Ok(())
    }
}

#[async_trait]
impl DurableQueue for JetStreamQueue {
    async fn enqueue(&self, payload: Vec<u8>, message_id: &str) -> Result<()> {
        let start = Instant::now();

        let result = self.publish_with_retry(&payload, message_id).await;

        MESSAGE_PUBLISH_DURATION
            .with_label_values(&[self.config.stream_name.as_str()])
            .observe(start.elapsed().as_secs_f64());

        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[self.config.stream_name.as_str(), status])
            .inc();

        result
    }

    async fn consume(&self) -> Result<DeliveryStream> {
        let messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        info!(
            "Consuming from stream {} as {}",
            self.config.stream_name, self.config.consumer_name
        );

        let stream_name = self.config.stream_name.clone();
        let deliveries = messages.map(move |msg| match msg {
            Ok(message) => {
                MESSAGE_RECEIVE_TOTAL
                    .with_label_values(&[stream_name.as_str(), "success"])
                    .inc();

                let attempt = message
                    .info()
                    .map(|info| info.delivered.max(1) as u64)
                    .unwrap_or(1);
                let payload = message.payload.clone();

                Ok(Delivery::new(
                    payload,
                    attempt,
                    Box::new(JetStreamAcker { message }),
                ))
            }
            Err(e) => {
                MESSAGE_RECEIVE_TOTAL
                    .with_label_values(&[stream_name.as_str(), "error"])
                    .inc();
                Err(Error::Subscribe(e.to_string()))
            }
        });

        Ok(deliveries.boxed())
    }
}

/// Settles a JetStream message
struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn settle(&self, settlement: Settlement) -> Result<()> {
        let kind = match settlement {
            Settlement::Ack => AckKind::Ack,
            Settlement::Nak(delay) => AckKind::Nak(delay),
            Settlement::Term => AckKind::Term,
        };

        self.message
            .ack_with(kind)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = JetStreamConfig::default();
        assert_eq!(config.stream_name, "LEDGER_COMMANDS");
        assert_eq!(config.subject, "ledger.commands");
        assert_eq!(config.max_deliver, -1);
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_enqueue_and_consume() {
        let config = JetStreamConfig {
            stream_name: "LEDGER_COMMANDS_TEST".to_string(),
            subject: "ledger.commands.test".to_string(),
            consumer_name: "ledger-worker-test".to_string(),
            ..Default::default()
        };
        let queue = JetStreamQueue::connect("nats://localhost:4222", config)
            .await
            .expect("Failed to connect");

        queue
            .enqueue(b"{\"type\":\"deposit\"}".to_vec(), "test-msg-1")
            .await
            .expect("Failed to enqueue");

        let mut deliveries = queue.consume().await.expect("Failed to consume");
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"{\"type\":\"deposit\"}");
        delivery.ack().await.unwrap();
    }
}
