//! Append-only document log
//!
//! A JetStream stream with limits retention used as a document collection:
//! every append stores one JSON document, and the stream sequence number is
//! its insertion-order key.

use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context as JetStreamContext,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{metrics::MESSAGE_PUBLISH_TOTAL, Error, Result};

/// Append-only JSON document log on a JetStream stream
#[derive(Clone)]
pub struct DocumentLog {
    context: JetStreamContext,
    stream_name: String,
    subject: String,
}

impl DocumentLog {
    /// Connect to NATS and ensure the log stream exists
    pub async fn connect(nats_url: &str, stream_name: &str, subject: &str) -> Result<Self> {
        info!("Connecting document log {} to NATS at {}", stream_name, nats_url);

        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Self::with_client(client, stream_name, subject).await
    }

    /// Build the log on an existing client connection
    pub async fn with_client(
        client: async_nats::Client,
        stream_name: &str,
        subject: &str,
    ) -> Result<Self> {
        let context = async_nats::jetstream::new(client);

        let config = StreamConfig {
            name: stream_name.to_string(),
            description: Some("Append-only document log".to_string()),
            subjects: vec![subject.to_string()],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: Duration::from_secs(365 * 24 * 3600),
            ..Default::default()
        };

        match context.get_or_create_stream(config).await {
            Ok(_) => info!("Document log stream {} ready", stream_name),
            Err(e) => {
                error!("Failed to create document log stream {}: {}", stream_name, e);
                return Err(Error::StreamCreation(e.to_string()));
            }
        }

        Ok(Self {
            context,
            stream_name: stream_name.to_string(),
            subject: subject.to_string(),
        })
    }

    /// Append a document, returning its sequence number
    pub async fn append<T: Serialize + Sync>(&self, document: &T) -> Result<u64> {
        let payload = serde_json::to_vec(document)?;

        let result = async {
            self.context
                .publish(self.subject.clone(), payload.into())
                .await
                .map_err(|e| Error::Publish(e.to_string()))?
                .await
                .map_err(|e| Error::Publish(e.to_string()))
        }
        .await;

        let status = if result.is_ok() { "success" } else { "error" };
        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[self.stream_name.as_str(), status])
            .inc();

        let ack = result?;
        debug!("Document appended to {} at sequence {}", self.stream_name, ack.sequence);
        Ok(ack.sequence)
    }
}
