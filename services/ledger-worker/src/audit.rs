// Audit mirror on a JetStream document log

use async_trait::async_trait;
use ledger_core::{AuditRecord, AuditStore};
use message_bus::DocumentLog;
use tracing::debug;

/// `AuditStore` writing one JSON document per applied mutation
#[derive(Clone)]
pub struct JetStreamAuditLog {
    log: DocumentLog,
}

impl JetStreamAuditLog {
    pub async fn connect(
        nats_url: &str,
        stream_name: &str,
        subject: &str,
    ) -> message_bus::Result<Self> {
        let log = DocumentLog::connect(nats_url, stream_name, subject).await?;
        Ok(Self { log })
    }

    pub fn new(log: DocumentLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl AuditStore for JetStreamAuditLog {
    async fn record(&self, record: &AuditRecord) -> ledger_core::Result<()> {
        let sequence = self
            .log
            .append(record)
            .await
            .map_err(|e| ledger_core::Error::Unavailable(e.to_string()))?;

        debug!(
            account_id = %record.account_id,
            kind = %record.kind,
            sequence,
            "Audit record stored"
        );
        Ok(())
    }
}
