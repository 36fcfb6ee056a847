use crate::consumer::ConsumerConfig;
use config::{ConfigError, Environment, File};
use message_bus::JetStreamConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub subject: String,
    pub consumer_name: String,
    pub ack_wait_secs: u64,
    pub max_deliver: i64,
    pub audit_stream: String,
    pub audit_subject: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub channel_capacity: usize,
    pub store_timeout_ms: u64,
    pub redelivery_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("nats.url", "nats://localhost:4222")?
            .set_default("nats.stream_name", "LEDGER_COMMANDS")?
            .set_default("nats.subject", "ledger.commands")?
            .set_default("nats.consumer_name", "ledger-worker")?
            .set_default("nats.ack_wait_secs", 30)?
            .set_default("nats.max_deliver", -1)?
            .set_default("nats.audit_stream", "LEDGER_AUDIT")?
            .set_default("nats.audit_subject", "ledger.audit.transactions")?
            .set_default("worker.pool_size", 5)?
            .set_default("worker.channel_capacity", 64)?
            .set_default("worker.store_timeout_ms", 5_000)?
            .set_default("worker.redelivery_delay_ms", 1_000)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("LEDGER_WORKER")
                .separator("__")
                .list_separator(","),
        );

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(nats_url) = env::var("NATS_URL") {
            builder = builder.set_override("nats.url", nats_url)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL is required".to_string());
        }

        if self.nats.stream_name.is_empty() || self.nats.audit_stream.is_empty() {
            return Err("Stream names cannot be empty".to_string());
        }

        if self.worker.pool_size == 0 {
            return Err("Worker pool size cannot be 0".to_string());
        }

        if self.worker.channel_capacity == 0 {
            return Err("Worker channel capacity cannot be 0".to_string());
        }

        if self.worker.store_timeout_ms == 0 {
            return Err("Store timeout cannot be 0".to_string());
        }

        Ok(())
    }

    /// Command queue settings
    pub fn jetstream(&self) -> JetStreamConfig {
        JetStreamConfig {
            stream_name: self.nats.stream_name.clone(),
            subject: self.nats.subject.clone(),
            consumer_name: self.nats.consumer_name.clone(),
            ack_wait: Duration::from_secs(self.nats.ack_wait_secs),
            max_deliver: self.nats.max_deliver,
            ..Default::default()
        }
    }

    /// Consumer pool settings
    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            pool_size: self.worker.pool_size,
            channel_capacity: self.worker.channel_capacity,
            store_timeout: Duration::from_millis(self.worker.store_timeout_ms),
            redelivery_delay: Duration::from_millis(self.worker.redelivery_delay_ms),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database.acquire_timeout_secs)
    }
}
