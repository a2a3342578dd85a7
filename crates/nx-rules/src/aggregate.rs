//! Aggregation Buckets
//!
//! Deferred events grouped by `(tenant, key)`. A bucket opens on first
//! registration with a closing deadline of `now + window`; further events
//! within the window join the bucket. Closed buckets flush as one
//! synthesized event carrying the union of recipients and the highest
//! priority seen. Mutation is serialised per key by the per-entry lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use nx_common::NotificationEvent;

struct Bucket {
    window_end: DateTime<Utc>,
    events: Vec<NotificationEvent>,
}

pub struct AggregationBuckets {
    buckets: DashMap<(String, String), Bucket>,
}

impl AggregationBuckets {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Add an event to its `(tenant, key)` bucket, opening the bucket when
    /// absent.
    pub fn register(&self, event: &NotificationEvent, key: &str, window_seconds: u64) {
        let bucket_key = (event.tenant_id.clone(), key.to_string());
        let mut entry = self.buckets.entry(bucket_key).or_insert_with(|| Bucket {
            window_end: Utc::now() + chrono::Duration::seconds(window_seconds as i64),
            events: Vec::new(),
        });
        entry.events.push(event.clone());
        debug!(
            tenant_id = %event.tenant_id,
            key = %key,
            size = entry.events.len(),
            "Event registered in aggregation bucket"
        );
    }

    /// Flush every bucket whose window has closed, one synthesized event per
    /// bucket.
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<NotificationEvent> {
        let expired: Vec<(String, String)> = self
            .buckets
            .iter()
            .filter(|entry| entry.value().window_end <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut flushed = Vec::new();
        for key in expired {
            if let Some((_, bucket)) = self.buckets.remove(&key) {
                if let Some(event) = synthesize(&key.1, bucket.events) {
                    flushed.push(event);
                }
            }
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for AggregationBuckets {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse a bucket into one event. The first event provides the shape;
/// recipients are unioned by id, priority is the highest seen, and the
/// aggregate metadata records the member ids.
fn synthesize(key: &str, events: Vec<NotificationEvent>) -> Option<NotificationEvent> {
    let mut iter = events.into_iter();
    let mut base = iter.next()?;

    let mut member_ids = vec![base.id.clone()];
    let mut count = 1u64;
    for event in iter {
        count += 1;
        member_ids.push(event.id.clone());
        if event.priority < base.priority {
            base.priority = event.priority;
        }
        for recipient in event.recipients {
            if !base.recipients.iter().any(|r| r.id == recipient.id) {
                base.recipients.push(recipient);
            }
        }
    }

    base.id = uuid::Uuid::new_v4().to_string();
    base.metadata.insert("aggregateKey".into(), serde_json::json!(key));
    base.metadata.insert("aggregateCount".into(), serde_json::json!(count));
    base.metadata.insert("aggregatedEventIds".into(), serde_json::json!(member_ids));
    base.created_at = Utc::now();
    base.scheduled_for = None;
    Some(base)
}
