//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the NATS server
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream missing and could not be created
    #[error("Stream creation error: {0}")]
    StreamCreation(String),

    /// Durable consumer missing and could not be created
    #[error("Consumer creation error: {0}")]
    ConsumerCreation(String),

    /// Publish not acknowledged by the stream
    #[error("Publish error: {0}")]
    Publish(String),

    /// Delivery stream could not be opened or read
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Settlement (ack / nak / term) not accepted
    #[error("Settlement error: {0}")]
    Ack(String),

    /// Document could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue closed, no further deliveries
    #[error("Queue closed")]
    Closed,
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
