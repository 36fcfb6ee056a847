//! Queue and document log metrics
//!
//! Every series is labelled with the JetStream stream it concerns (the
//! in-memory queue reports as `in_memory`).

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Publishes to a stream, by outcome
    pub static ref MESSAGE_PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_publish_total",
        "Messages published, including retried attempts that finally failed",
        &["stream", "status"]
    )
    .unwrap();

    /// Publish latency including retries
    pub static ref MESSAGE_PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_publish_duration_seconds",
        "Time from enqueue call to stream acknowledgment",
        &["stream"]
    )
    .unwrap();

    /// Deliveries handed to consumers
    pub static ref MESSAGE_RECEIVE_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_receive_total",
        "Deliveries pulled from a stream",
        &["stream", "status"]
    )
    .unwrap();

    /// Settlements reported back to the broker
    pub static ref MESSAGE_SETTLE_TOTAL: CounterVec = register_counter_vec!(
        "message_bus_settle_total",
        "Deliveries settled (ack/nak/term)",
        &["settlement", "status"]
    )
    .unwrap();
}
