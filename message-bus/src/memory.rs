//! In-memory durable queue
//!
//! Mirrors the broker semantics the pipeline relies on:
//! - FIFO hand-out, one consumer at a time per message
//! - NAK or an unsettled drop puts the message back at the tail
//! - Optional `max_deliver`, after which the message is dead-lettered
//!
//! Unlike JetStream it does not deduplicate by message id, so tests can
//! simulate a redelivery by enqueueing the same payload twice.

use crate::{
    metrics::{MESSAGE_PUBLISH_TOTAL, MESSAGE_RECEIVE_TOTAL},
    queue::{Acker, Delivery, DeliveryStream, DurableQueue, Settlement},
    Error, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

const STREAM_LABEL: &str = "in_memory";

#[derive(Debug)]
struct Pending {
    payload: Bytes,
    message_id: String,
    attempt: u64,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Pending>,
    in_flight: usize,
    closed: bool,
    acked: u64,
    nacked: u64,
    terminated: u64,
    dead_lettered: u64,
    settled_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    available: Notify,
    max_deliver: Option<u64>,
}

impl Inner {
    fn requeue(&self, pending: Pending) {
        let mut state = self.state.lock();
        state.in_flight -= 1;

        if let Some(max) = self.max_deliver {
            if pending.attempt >= max {
                warn!(
                    message_id = %pending.message_id,
                    attempt = pending.attempt,
                    "Max deliveries reached, dead-lettering message"
                );
                state.dead_lettered += 1;
                return;
            }
        }

        state.ready.push_back(Pending {
            attempt: pending.attempt + 1,
            ..pending
        });
        drop(state);
        self.available.notify_one();
    }
}

/// In-memory queue with at-least-once redelivery
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    /// Create an unbounded-redelivery queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that dead-letters after `max_deliver` attempts
    pub fn with_max_deliver(max_deliver: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_deliver: Some(max_deliver),
                ..Default::default()
            }),
        }
    }

    /// End the delivery stream once the backlog is handed out
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.available.notify_waiters();
        self.inner.available.notify_one();
    }

    /// Messages waiting to be delivered
    pub fn pending(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Deliveries handed out and not yet settled
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Deliveries acknowledged
    pub fn acked(&self) -> u64 {
        self.inner.state.lock().acked
    }

    /// Deliveries negatively acknowledged
    pub fn nacked(&self) -> u64 {
        self.inner.state.lock().nacked
    }

    /// Deliveries terminated
    pub fn terminated(&self) -> u64 {
        self.inner.state.lock().terminated
    }

    /// Messages dropped after exhausting `max_deliver`
    pub fn dead_lettered(&self) -> u64 {
        self.inner.state.lock().dead_lettered
    }

    /// Message ids in the order they were acked or terminated
    pub fn settled_ids(&self) -> Vec<String> {
        self.inner.state.lock().settled_ids.clone()
    }

    /// True when nothing is waiting and nothing is in flight
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.ready.is_empty() && state.in_flight == 0
    }

    /// Wait until every message has been settled for good
    pub async fn wait_until_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn next_ready(&self) -> Option<Pending> {
        let mut state = self.inner.state.lock();
        let pending = state.ready.pop_front()?;
        state.in_flight += 1;
        Some(pending)
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, payload: Vec<u8>, message_id: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                MESSAGE_PUBLISH_TOTAL
                    .with_label_values(&[STREAM_LABEL, "error"])
                    .inc();
                return Err(Error::Closed);
            }
            state.ready.push_back(Pending {
                payload: Bytes::from(payload),
                message_id: message_id.to_string(),
                attempt: 1,
            });
        }

        MESSAGE_PUBLISH_TOTAL
            .with_label_values(&[STREAM_LABEL, "success"])
            .inc();
        self.inner.available.notify_one();
        Ok(())
    }

    async fn consume(&self) -> Result<DeliveryStream> {
        let queue = self.clone();

        let deliveries = futures::stream::unfold(queue, |queue| async move {
            loop {
                if let Some(pending) = queue.next_ready() {
                    MESSAGE_RECEIVE_TOTAL
                        .with_label_values(&[STREAM_LABEL, "success"])
                        .inc();

                    let delivery = Delivery::new(
                        pending.payload.clone(),
                        pending.attempt,
                        Box::new(InMemoryAcker {
                            inner: Arc::clone(&queue.inner),
                            pending: Mutex::new(Some(pending)),
                            settled: AtomicBool::new(false),
                        }),
                    );
                    return Some((Ok(delivery), queue));
                }

                if queue.is_closed() {
                    return None;
                }

                queue.inner.available.notified().await;
            }
        });

        Ok(deliveries.boxed())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    pending: Mutex<Option<Pending>>,
    settled: AtomicBool,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn settle(&self, settlement: Settlement) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::Ack("delivery already settled".to_string()));
        }

        let Some(pending) = self.pending.lock().take() else {
            return Err(Error::Ack("delivery already settled".to_string()));
        };

        match settlement {
            Settlement::Ack | Settlement::Term => {
                let mut state = self.inner.state.lock();
                state.in_flight -= 1;
                if settlement == Settlement::Ack {
                    state.acked += 1;
                } else {
                    state.terminated += 1;
                }
                state.settled_ids.push(pending.message_id);
            }
            Settlement::Nak(_) => {
                debug!(
                    message_id = %pending.message_id,
                    attempt = pending.attempt,
                    "Delivery nak'ed, requeueing"
                );
                self.inner.state.lock().nacked += 1;
                self.inner.requeue(pending);
            }
        }

        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(pending) = self.pending.lock().take() {
            debug!(
                message_id = %pending.message_id,
                "Delivery dropped unsettled, requeueing"
            );
            self.inner.requeue(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = InMemoryQueue::new();
        queue.enqueue(b"first".to_vec(), "m1").await.unwrap();
        queue.enqueue(b"second".to_vec(), "m2").await.unwrap();

        let mut deliveries = queue.consume().await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.payload(), b"first");
        assert_eq!(first.attempt(), 1);
        assert_eq!(queue.in_flight(), 1);

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.payload(), b"second");
        second.ack().await.unwrap();

        assert_eq!(queue.acked(), 2);
        assert!(queue.is_idle());
        assert_eq!(queue.settled_ids(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_next_attempt() {
        let queue = InMemoryQueue::new();
        queue.enqueue(b"payload".to_vec(), "m1").await.unwrap();

        let mut deliveries = queue.consume().await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.nak(None).await.unwrap();

        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload(), b"payload");
        assert_eq!(redelivered.attempt(), 2);
        redelivered.ack().await.unwrap();

        assert_eq!(queue.nacked(), 1);
        assert_eq!(queue.acked(), 1);
    }

    #[tokio::test]
    async fn test_unsettled_drop_redelivers() {
        let queue = InMemoryQueue::new();
        queue.enqueue(b"payload".to_vec(), "m1").await.unwrap();

        let mut deliveries = queue.consume().await.unwrap();
        drop(deliveries.next().await.unwrap().unwrap());

        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.in_flight(), 0);

        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert_eq!(redelivered.attempt(), 2);
        redelivered.term().await.unwrap();
        assert_eq!(queue.terminated(), 1);
    }

    #[tokio::test]
    async fn test_max_deliver_dead_letters() {
        let queue = InMemoryQueue::with_max_deliver(2);
        queue.enqueue(b"payload".to_vec(), "m1").await.unwrap();

        let mut deliveries = queue.consume().await.unwrap();
        deliveries.next().await.unwrap().unwrap().nak(None).await.unwrap();
        deliveries.next().await.unwrap().unwrap().nak(None).await.unwrap();

        assert_eq!(queue.dead_lettered(), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_backlog() {
        let queue = InMemoryQueue::new();
        queue.enqueue(b"payload".to_vec(), "m1").await.unwrap();
        queue.close();

        assert!(matches!(
            queue.enqueue(b"late".to_vec(), "m2").await,
            Err(Error::Closed)
        ));

        let mut deliveries = queue.consume().await.unwrap();
        deliveries.next().await.unwrap().unwrap().ack().await.unwrap();
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_enqueue() {
        let queue = InMemoryQueue::new();
        let mut deliveries = queue.consume().await.unwrap();

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.enqueue(b"late".to_vec(), "m1").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .expect("delivery not woken")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload(), b"late");
        delivery.ack().await.unwrap();
    }
}
