// Prometheus metrics for the ledger worker

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref COMMANDS_TOTAL: CounterVec = register_counter_vec!(
        "ledger_commands_total",
        "Total commands processed, by kind and outcome",
        &["kind", "outcome"]
    )
    .unwrap();

    pub static ref COMMAND_APPLY_DURATION: HistogramVec = register_histogram_vec!(
        "ledger_command_apply_duration_seconds",
        "Time spent applying a command to the ledger store",
        &["kind"],
        vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]
    )
    .unwrap();

    pub static ref AUDIT_MIRROR_FAILURES: IntCounter = register_int_counter!(
        "ledger_audit_mirror_failures_total",
        "Audit records that could not be written"
    )
    .unwrap();

    pub static ref SERIALIZER_TRACKED_ACCOUNTS: IntGauge = register_int_gauge!(
        "ledger_serializer_tracked_accounts",
        "Accounts with a lock in the account serializer"
    )
    .unwrap();
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
