//! Priority Queue
//!
//! Four in-memory FIFO sub-queues keyed by priority plus an in-flight map:
//! - Strict FIFO within one priority; Critical > High > Normal > Low across
//!   priorities at dequeue time (no fairness for lower priorities)
//! - A message is in at most one sub-queue XOR the in-flight map
//! - `scheduled_for` in the future makes dequeue skip the message, rechecked
//!   at most once per poll
//! - Atomic counters; `stats()` returns a consistent snapshot

use chrono::Utc;
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

use nx_common::{Priority, QueueMessage, Shutdown};

pub mod dlq;
pub mod error;

pub use dlq::{DeadLetterStore, DlqEntry};
pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// What happened to a nacked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    Requeued,
    DeadLettered,
}

/// Monotonic queue counters, updated atomically.
#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_critical: usize,
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub in_flight: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    pub total_dead_lettered: u64,
}

impl QueueStats {
    pub fn pending_total(&self) -> usize {
        self.pending_critical + self.pending_high + self.pending_normal + self.pending_low
    }
}

/// Queue health signal for the /health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueHealth {
    Healthy,
    /// Pending backlog above 80% of capacity
    Warning,
    /// At capacity; enqueues are being rejected
    Degraded,
}

/// The four-priority FIFO queue with in-flight tracking.
pub struct PriorityQueue {
    queues: [Mutex<VecDeque<QueueMessage>>; 4],
    in_flight: DashMap<String, QueueMessage>,
    counters: QueueCounters,
    notify: Notify,
    max_depth: usize,
}

impl PriorityQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            queues: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            in_flight: DashMap::new(),
            counters: QueueCounters::default(),
            notify: Notify::new(),
            max_depth,
        }
    }

    /// Append to the sub-queue matching the message priority.
    ///
    /// Returns false (without enqueueing) when the sub-queue is at capacity.
    pub fn enqueue(&self, message: QueueMessage) -> bool {
        let priority = message.priority;
        {
            let mut queue = self.queues[priority.index()].lock();
            if queue.len() >= self.max_depth {
                warn!(
                    message_id = %message.id,
                    tenant_id = %message.tenant_id,
                    priority = %priority,
                    depth = queue.len(),
                    "Sub-queue at capacity, rejecting enqueue"
                );
                return false;
            }
            queue.push_back(message);
        }
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        counter!("nx_queue_enqueued_total", "priority" => priority.to_string()).increment(1);
        self.notify.notify_one();
        true
    }

    /// Scan sub-queues Critical -> Low and return the first due message,
    /// moving it to the in-flight map.
    ///
    /// Messages whose `scheduled_for` is still in the future are rotated to
    /// the back of their sub-queue; each is reconsidered at most once per
    /// call.
    pub fn dequeue_highest(&self) -> Option<QueueMessage> {
        let now = Utc::now();
        for priority in Priority::ALL {
            let mut queue = self.queues[priority.index()].lock();
            let mut scanned = 0;
            let len = queue.len();
            while scanned < len {
                let message = match queue.pop_front() {
                    Some(m) => m,
                    None => break,
                };
                if message.is_due(now) {
                    drop(queue);
                    self.counters.dequeued.fetch_add(1, Ordering::SeqCst);
                    self.in_flight.insert(message.id.clone(), message.clone());
                    gauge!("nx_queue_in_flight").set(self.in_flight.len() as f64);
                    return Some(message);
                }
                queue.push_back(message);
                scanned += 1;
            }
        }
        None
    }

    /// Dequeue, suspending until a message is available or shutdown trips.
    ///
    /// `poll_interval_ms` bounds the recheck latency for future-scheduled
    /// messages that no enqueue will announce.
    pub async fn dequeue_or_wait(
        &self,
        shutdown: &Shutdown,
        poll_interval_ms: u64,
    ) -> Option<QueueMessage> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(message) = self.dequeue_highest() {
                return Some(message);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(poll_interval_ms)) => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    /// Acknowledge an in-flight message, removing it from the queue entirely.
    pub fn ack(&self, message_id: &str) -> Result<QueueMessage> {
        let (_, message) = self
            .in_flight
            .remove(message_id)
            .ok_or_else(|| QueueError::NotInFlight(message_id.to_string()))?;
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        counter!("nx_queue_acked_total").increment(1);
        debug!(message_id = %message_id, "Message acked");
        Ok(message)
    }

    /// Negative-acknowledge an in-flight message.
    ///
    /// Retryable nacks re-enqueue at the same priority with `attempt + 1`;
    /// non-retryable nacks move the message to `dlq`.
    pub fn nack(
        &self,
        message_id: &str,
        retryable: bool,
        error: &str,
        dlq: &DeadLetterStore,
    ) -> Result<NackDisposition> {
        let (_, mut message) = self
            .in_flight
            .remove(message_id)
            .ok_or_else(|| QueueError::NotInFlight(message_id.to_string()))?;
        self.counters.nacked.fetch_add(1, Ordering::SeqCst);

        if retryable {
            message.attempt += 1;
            let fallback = message.clone();
            if !self.enqueue(message) {
                // keep the message addressable so the caller can dead-letter
                self.in_flight.insert(fallback.id.clone(), fallback);
                return Err(QueueError::AtCapacity(self.max_depth));
            }
            Ok(NackDisposition::Requeued)
        } else {
            self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
            counter!("nx_queue_dead_lettered_total").increment(1);
            dlq.record(message, error);
            Ok(NackDisposition::DeadLettered)
        }
    }

    /// Re-enqueue an in-flight message for a delayed retry.
    ///
    /// Used by the worker pool's backoff schedule: bumps the attempt count
    /// and sets `scheduled_for` so dequeue skips the message until due.
    pub fn requeue_with_delay(
        &self,
        message_id: &str,
        scheduled_for: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let (_, mut message) = self
            .in_flight
            .remove(message_id)
            .ok_or_else(|| QueueError::NotInFlight(message_id.to_string()))?;
        message.attempt += 1;
        message.scheduled_for = Some(scheduled_for);
        self.counters.nacked.fetch_add(1, Ordering::SeqCst);
        let fallback = message.clone();
        if !self.enqueue(message) {
            // keep the message addressable so the caller can dead-letter
            self.in_flight.insert(fallback.id.clone(), fallback);
            return Err(QueueError::AtCapacity(self.max_depth));
        }
        Ok(())
    }

    /// Move an in-flight message straight to the DLQ.
    pub fn dead_letter(&self, message_id: &str, error: &str, dlq: &DeadLetterStore) -> Result<()> {
        let (_, message) = self
            .in_flight
            .remove(message_id)
            .ok_or_else(|| QueueError::NotInFlight(message_id.to_string()))?;
        self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
        counter!("nx_queue_dead_lettered_total").increment(1);
        dlq.record(message, error);
        Ok(())
    }

    /// Pending messages, optionally for one priority only.
    pub fn len(&self, priority: Option<Priority>) -> usize {
        match priority {
            Some(p) => self.queues[p.index()].lock().len(),
            None => self.queues.iter().map(|q| q.lock().len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len(None) == 0 && self.in_flight.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop all pending messages. In-flight messages are unaffected.
    pub fn purge(&self) -> usize {
        let mut removed = 0;
        for queue in &self.queues {
            let mut queue = queue.lock();
            removed += queue.len();
            queue.clear();
        }
        removed
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_critical: self.queues[0].lock().len(),
            pending_high: self.queues[1].lock().len(),
            pending_normal: self.queues[2].lock().len(),
            pending_low: self.queues[3].lock().len(),
            in_flight: self.in_flight.len(),
            total_enqueued: self.counters.enqueued.load(Ordering::SeqCst),
            total_dequeued: self.counters.dequeued.load(Ordering::SeqCst),
            total_acked: self.counters.acked.load(Ordering::SeqCst),
            total_nacked: self.counters.nacked.load(Ordering::SeqCst),
            total_dead_lettered: self.counters.dead_lettered.load(Ordering::SeqCst),
        }
    }

    pub fn health(&self) -> QueueHealth {
        let pending = self.len(None);
        let capacity = self.max_depth * 4;
        if pending >= capacity {
            QueueHealth::Degraded
        } else if pending * 5 >= capacity * 4 {
            QueueHealth::Warning
        } else {
            QueueHealth::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_common::{Channel, NotificationEvent, NotificationRecipient};
    use std::collections::HashMap;

    fn message(id: &str, priority: Priority) -> QueueMessage {
        let event = NotificationEvent {
            id: format!("evt-{}", id),
            tenant_id: "t1".into(),
            event_type: "test".into(),
            priority,
            subject: None,
            content: None,
            title: None,
            icon_url: None,
            action_url: None,
            recipients: vec![],
            preferred_channels: vec![Channel::Email],
            scheduled_for: None,
            correlation_id: None,
            source: "test".into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            template_id: None,
        };
        let mut msg = QueueMessage::new(event, NotificationRecipient::default(), Channel::Email);
        msg.id = id.to_string();
        msg
    }

    #[test]
    fn fifo_within_priority() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(message("a", Priority::Normal));
        queue.enqueue(message("b", Priority::Normal));

        assert_eq!(queue.dequeue_highest().unwrap().id, "a");
        assert_eq!(queue.dequeue_highest().unwrap().id, "b");
    }

    #[test]
    fn critical_preempts_lower_priorities() {
        let queue = PriorityQueue::new(2000);
        for i in 0..1000 {
            queue.enqueue(message(&format!("low-{}", i), Priority::Low));
        }
        queue.enqueue(message("critical", Priority::Critical));

        assert_eq!(queue.dequeue_highest().unwrap().id, "critical");
    }

    #[test]
    fn scheduled_messages_are_skipped_until_due() {
        let queue = PriorityQueue::new(100);
        let mut future = message("later", Priority::Normal);
        future.scheduled_for = Some(Utc::now() + chrono::Duration::seconds(60));
        queue.enqueue(future);
        queue.enqueue(message("now", Priority::Normal));

        assert_eq!(queue.dequeue_highest().unwrap().id, "now");
        assert!(queue.dequeue_highest().is_none());
        assert_eq!(queue.len(Some(Priority::Normal)), 1);
    }

    #[test]
    fn message_is_in_queue_xor_in_flight() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(message("m", Priority::High));
        assert_eq!(queue.len(None), 1);
        assert_eq!(queue.in_flight_len(), 0);

        let dequeued = queue.dequeue_highest().unwrap();
        assert_eq!(queue.len(None), 0);
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&dequeued.id).unwrap();
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn retryable_nack_requeues_with_incremented_attempt() {
        let queue = PriorityQueue::new(100);
        let dlq = DeadLetterStore::new(10);
        queue.enqueue(message("m", Priority::Normal));
        let dequeued = queue.dequeue_highest().unwrap();
        assert_eq!(dequeued.attempt, 1);

        let disposition = queue.nack(&dequeued.id, true, "boom", &dlq).unwrap();
        assert_eq!(disposition, NackDisposition::Requeued);

        let again = queue.dequeue_highest().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(dlq.len(), 0);
    }

    #[test]
    fn non_retryable_nack_dead_letters() {
        let queue = PriorityQueue::new(100);
        let dlq = DeadLetterStore::new(10);
        queue.enqueue(message("m", Priority::Normal));
        let dequeued = queue.dequeue_highest().unwrap();

        let disposition = queue.nack(&dequeued.id, false, "bad recipient", &dlq).unwrap();
        assert_eq!(disposition, NackDisposition::DeadLettered);
        assert_eq!(dlq.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn counters_balance() {
        let queue = PriorityQueue::new(100);
        let dlq = DeadLetterStore::new(10);
        for i in 0..5 {
            queue.enqueue(message(&format!("m{}", i), Priority::Normal));
        }
        let a = queue.dequeue_highest().unwrap();
        let b = queue.dequeue_highest().unwrap();
        queue.ack(&a.id).unwrap();
        queue.nack(&b.id, false, "x", &dlq).unwrap();

        let stats = queue.stats();
        // dequeues - acks - dlq-moves = in-flight
        assert_eq!(
            stats.total_dequeued - stats.total_acked - stats.total_dead_lettered,
            stats.in_flight as u64
        );
        assert_eq!(stats.pending_total(), 3);
    }

    #[test]
    fn enqueue_rejected_at_capacity() {
        let queue = PriorityQueue::new(2);
        assert!(queue.enqueue(message("a", Priority::Low)));
        assert!(queue.enqueue(message("b", Priority::Low)));
        assert!(!queue.enqueue(message("c", Priority::Low)));
        // other priorities unaffected
        assert!(queue.enqueue(message("d", Priority::High)));
    }

    #[test]
    fn purge_clears_pending_only() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(message("a", Priority::Normal));
        queue.enqueue(message("b", Priority::Low));
        let c = {
            queue.enqueue(message("c", Priority::Critical));
            queue.dequeue_highest().unwrap()
        };

        assert_eq!(queue.purge(), 2);
        assert_eq!(queue.len(None), 0);
        assert_eq!(queue.in_flight_len(), 1);
        queue.ack(&c.id).unwrap();
    }

    #[tokio::test]
    async fn dequeue_or_wait_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(PriorityQueue::new(100));
        let shutdown = std::sync::Arc::new(Shutdown::new());

        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.dequeue_or_wait(&shutdown, 5_000).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.enqueue(message("m", Priority::Normal));

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("should wake")
            .unwrap();
        assert_eq!(result.unwrap().id, "m");
    }

    #[tokio::test]
    async fn dequeue_or_wait_returns_none_on_shutdown() {
        let queue = std::sync::Arc::new(PriorityQueue::new(100));
        let shutdown = std::sync::Arc::new(Shutdown::new());

        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { queue.dequeue_or_wait(&shutdown, 5_000).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("should wake")
            .unwrap();
        assert!(result.is_none());
    }
}
