//! Dead-Letter Store
//!
//! Holds messages that exhausted their retry budget or hit a permanent
//! error. Entries keep insertion order for operator listing; the store is
//! capped and evicts oldest-first.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use nx_common::QueueMessage;

/// One dead-lettered message with its failure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub message: QueueMessage,
    pub last_error: String,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct DeadLetterStore {
    // keyed by queue-message id; IndexMap preserves arrival order
    entries: Mutex<IndexMap<String, DlqEntry>>,
    max_entries: usize,
}

impl DeadLetterStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_entries,
        }
    }

    /// Record a message. A repeat arrival of the same message id updates the
    /// error and attempt count rather than duplicating the entry.
    pub fn record(&self, message: QueueMessage, error: &str) {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get_mut(&message.id) {
            existing.last_error = error.to_string();
            existing.attempts = message.attempt;
            existing.last_seen = now;
            return;
        }

        if entries.len() >= self.max_entries {
            if let Some((evicted_id, _)) = entries.shift_remove_index(0) {
                warn!(message_id = %evicted_id, "DLQ at capacity, evicting oldest entry");
            }
        }

        entries.insert(
            message.id.clone(),
            DlqEntry {
                attempts: message.attempt,
                last_error: error.to_string(),
                first_seen: now,
                last_seen: now,
                message,
            },
        );
    }

    /// All entries in arrival order.
    pub fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Entries owned by one tenant, in arrival order.
    pub fn entries_for_tenant(&self, tenant_id: &str) -> Vec<DlqEntry> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.message.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, message_id: &str) -> Option<DlqEntry> {
        self.entries.lock().get(message_id).cloned()
    }

    /// Remove and return an entry, e.g. for operator requeue.
    pub fn take(&self, message_id: &str) -> Option<DlqEntry> {
        self.entries.lock().shift_remove(message_id)
    }

    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nx_common::{Channel, NotificationEvent, NotificationRecipient, Priority};
    use std::collections::HashMap;

    fn message(id: &str, tenant: &str) -> QueueMessage {
        let event = NotificationEvent {
            id: format!("evt-{}", id),
            tenant_id: tenant.into(),
            event_type: "test".into(),
            priority: Priority::Normal,
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
    fn records_in_arrival_order() {
        let store = DeadLetterStore::new(10);
        store.record(message("a", "t1"), "e1");
        store.record(message("b", "t1"), "e2");

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.id, "a");
        assert_eq!(entries[1].message.id, "b");
    }

    #[test]
    fn repeat_arrival_updates_instead_of_duplicating() {
        let store = DeadLetterStore::new(10);
        store.record(message("a", "t1"), "first");
        let mut again = message("a", "t1");
        again.attempt = 3;
        store.record(again, "second");

        assert_eq!(store.len(), 1);
        let entry = store.get("a").unwrap();
        assert_eq!(entry.last_error, "second");
        assert_eq!(entry.attempts, 3);
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let store = DeadLetterStore::new(2);
        store.record(message("a", "t1"), "e");
        store.record(message("b", "t1"), "e");
        store.record(message("c", "t1"), "e");

        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn take_removes_for_requeue() {
        let store = DeadLetterStore::new(10);
        store.record(message("a", "t1"), "e");
        let taken = store.take("a").unwrap();
        assert_eq!(taken.message.id, "a");
        assert!(store.is_empty());
    }

    #[test]
    fn tenant_filter() {
        let store = DeadLetterStore::new(10);
        store.record(message("a", "t1"), "e");
        store.record(message("b", "t2"), "e");

        let t1 = store.entries_for_tenant("t1");
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].message.tenant_id, "t1");
    }
}
