//! Run Event Bus
//!
//! Publishes run lifecycle and node progress events over a broadcast
//! channel. Every event carries a per-run monotonically increasing `seq`;
//! delivery to a subscriber is at-least-once (a lagging subscriber may see
//! the stream resume after a gap, and consumers deduplicate on `seq`).
//! Subscribe/unsubscribe is idempotent: subscribing returns an independent
//! receiver, unsubscribing is dropping it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEventKind {
    RunCreated,
    RunStarted,
    NodeStarted,
    NodeProgress,
    NodeFinished,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub seq: u64,
    pub kind: RunEventKind,
    pub tenant_id: String,
    pub workflow_id: String,
    pub run_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Subscription scope: which events a consumer wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    Tenant(String),
    Workflow { tenant_id: String, workflow_id: String },
    Run { tenant_id: String, run_id: String },
}

impl EventScope {
    pub fn matches(&self, event: &RunEvent) -> bool {
        match self {
            EventScope::Tenant(tenant_id) => &event.tenant_id == tenant_id,
            EventScope::Workflow { tenant_id, workflow_id } => {
                &event.tenant_id == tenant_id && &event.workflow_id == workflow_id
            }
            EventScope::Run { tenant_id, run_id } => {
                &event.tenant_id == tenant_id && &event.run_id == run_id
            }
        }
    }
}

pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    sequences: DashMap<String, AtomicU64>,
}

impl RunEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(16));
        Self {
            sender,
            sequences: DashMap::new(),
        }
    }

    /// Publish one event, assigning the run's next sequence number.
    pub fn publish(
        &self,
        kind: RunEventKind,
        tenant_id: &str,
        workflow_id: &str,
        run_id: &str,
        node_id: Option<&str>,
        data: serde_json::Value,
    ) -> u64 {
        let seq = self
            .sequences
            .entry(run_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let event = RunEvent {
            seq,
            kind,
            tenant_id: tenant_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            node_id: node_id.map(String::from),
            at: Utc::now(),
            data,
        };

        debug!(
            run_id = %run_id,
            seq,
            kind = ?kind,
            node_id = ?node_id,
            "Run event published"
        );
        // no subscribers is fine
        let _ = self.sender.send(event);
        seq
    }

    /// A new receiver over the full stream; filter with an `EventScope`.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Forget a finished run's sequence counter.
    pub fn forget_run(&self, run_id: &str) {
        self.sequences.remove(run_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_is_monotonic_per_run() {
        let bus = RunEventBus::new(64);
        let mut rx = bus.subscribe();

        bus.publish(RunEventKind::RunCreated, "t", "w", "r1", None, serde_json::json!({}));
        bus.publish(RunEventKind::RunStarted, "t", "w", "r1", None, serde_json::json!({}));
        bus.publish(RunEventKind::RunCreated, "t", "w", "r2", None, serde_json::json!({}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let other_run = rx.recv().await.unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        // a different run starts its own sequence
        assert_eq!(other_run.seq, 0);
        assert!(first.seq < second.seq);
    }

    #[test]
    fn scope_matching() {
        let event = RunEvent {
            seq: 0,
            kind: RunEventKind::NodeStarted,
            tenant_id: "t1".into(),
            workflow_id: "w1".into(),
            run_id: "r1".into(),
            node_id: Some("n1".into()),
            at: Utc::now(),
            data: serde_json::Value::Null,
        };

        assert!(EventScope::Tenant("t1".into()).matches(&event));
        assert!(!EventScope::Tenant("t2".into()).matches(&event));
        assert!(EventScope::Run {
            tenant_id: "t1".into(),
            run_id: "r1".into()
        }
        .matches(&event));
        assert!(!EventScope::Run {
            tenant_id: "t2".into(),
            run_id: "r1".into()
        }
        .matches(&event));
        assert!(EventScope::Workflow {
            tenant_id: "t1".into(),
            workflow_id: "w1".into()
        }
        .matches(&event));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_stream() {
        let bus = RunEventBus::new(64);
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.publish(RunEventKind::RunCreated, "t", "w", "r", None, serde_json::json!({}));

        assert_eq!(rx_a.recv().await.unwrap().seq, 0);
        assert_eq!(rx_b.recv().await.unwrap().seq, 0);
    }
}
