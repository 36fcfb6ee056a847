use anyhow::Context;
use dotenv::dotenv;
use ledger_core::PgLedgerStore;
use ledger_worker::{config::Config, metrics, ConsumerPool, JetStreamAuditLog};
use message_bus::JetStreamQueue;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    info!(
        stream = %config.nats.stream_name,
        consumer = %config.nats.consumer_name,
        pool_size = config.worker.pool_size,
        "Starting Ledger Worker"
    );

    let ledger = Arc::new(
        PgLedgerStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.acquire_timeout(),
        )
        .await
        .context("Failed to connect to database")?,
    );

    let queue = Arc::new(
        JetStreamQueue::connect(&config.nats.url, config.jetstream())
            .await
            .context("Failed to connect to command queue")?,
    );

    let audit = Arc::new(
        JetStreamAuditLog::connect(
            &config.nats.url,
            &config.nats.audit_stream,
            &config.nats.audit_subject,
        )
        .await
        .context("Failed to connect to audit log")?,
    );

    let handle = ConsumerPool::new(queue, ledger, audit, config.consumer())
        .spawn()
        .await
        .context("Failed to start consumer pool")?;

    let shutdown = handle.shutdown_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, draining in-flight deliveries");
                shutdown.trigger();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    handle.join().await;

    debug!("Final metrics:\n{}", metrics::render());
    info!("Ledger Worker stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    }
}
