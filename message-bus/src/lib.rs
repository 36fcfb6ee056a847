//! Durable command queue
//!
//! Provides the at-least-once delivery capability the ledger pipeline
//! consumes:
//! - `DurableQueue` trait with manual settlement (ack / nak / term)
//! - JetStream work-queue implementation for production
//! - In-memory implementation with redelivery semantics for tests
//! - Append-only JetStream document log (audit mirror backing)
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod document_log;
pub mod error;
pub mod jetstream;
pub mod memory;
pub mod metrics;
pub mod queue;

pub use document_log::DocumentLog;
pub use error::{Error, Result};
pub use jetstream::{JetStreamConfig, JetStreamQueue};
pub use memory::InMemoryQueue;
pub use queue::{Acker, Delivery, DeliveryStream, DurableQueue, Settlement};
