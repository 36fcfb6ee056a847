//! Ledger Worker
//!
//! Consumes queued ledger commands and applies them: a bounded pool of
//! workers, per-account serialization, idempotent application against the
//! ledger store and a best-effort audit mirror.

pub mod audit;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod intake;
pub mod metrics;
pub mod serializer;

pub use audit::JetStreamAuditLog;
pub use config::Config;
pub use consumer::{ConsumerConfig, ConsumerPool, Outcome, PoolHandle, ShutdownSignal};
pub use errors::{IntakeError, Result, WorkerError};
pub use intake::Intake;
pub use serializer::AccountSerializer;
