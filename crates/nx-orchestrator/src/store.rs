//! Notification Store
//!
//! In-memory record of every ingested notification: lifecycle status,
//! per-target delivery history, acknowledgement. Keyed by
//! `(tenant_id, notification_id)`: the idempotency key. Repositories hold
//! whole entities; callers receive clones, never references into the map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationStatus};

/// Per-target delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Enqueued,
    Delivered,
    Retrying,
    Failed,
    DeadLettered,
    ValidationFailed,
    NoProvider,
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TargetStatus::Enqueued | TargetStatus::Retrying)
    }
}

/// One delivery attempt against one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// State of one `(recipient, channel)` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub recipient_id: String,
    pub channel: Channel,
    pub status: TargetStatus,
    pub attempts: u32,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub history: Vec<DeliveryAttempt>,
}

/// Full record of one ingested notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub event: NotificationEvent,
    pub status: NotificationStatus,
    pub matched_rules: Vec<String>,
    pub targets: Vec<TargetRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

pub struct NotificationStore {
    records: DashMap<(String, String), NotificationRecord>,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn contains(&self, tenant_id: &str, notification_id: &str) -> bool {
        self.records
            .contains_key(&(tenant_id.to_string(), notification_id.to_string()))
    }

    pub fn insert(&self, record: NotificationRecord) {
        let key = (record.event.tenant_id.clone(), record.event.id.clone());
        self.records.insert(key, record);
    }

    pub fn get(&self, tenant_id: &str, notification_id: &str) -> Option<NotificationRecord> {
        self.records
            .get(&(tenant_id.to_string(), notification_id.to_string()))
            .map(|r| r.clone())
    }

    pub fn list_for_tenant(&self, tenant_id: &str) -> Vec<NotificationRecord> {
        self.records
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn set_status(&self, tenant_id: &str, notification_id: &str, status: NotificationStatus) {
        if let Some(mut record) = self
            .records
            .get_mut(&(tenant_id.to_string(), notification_id.to_string()))
        {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }

    /// Idempotent acknowledgement. Returns false when the notification is
    /// unknown.
    pub fn acknowledge(&self, tenant_id: &str, notification_id: &str, by: &str) -> bool {
        match self
            .records
            .get_mut(&(tenant_id.to_string(), notification_id.to_string()))
        {
            Some(mut record) => {
                if record.acknowledged_at.is_none() {
                    record.status = NotificationStatus::Acknowledged;
                    record.acknowledged_by = Some(by.to_string());
                    record.acknowledged_at = Some(Utc::now());
                    record.updated_at = Utc::now();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_acknowledged(&self, tenant_id: &str, notification_id: &str) -> bool {
        self.records
            .get(&(tenant_id.to_string(), notification_id.to_string()))
            .map(|r| r.acknowledged_at.is_some())
            .unwrap_or(false)
    }

    /// Record the outcome of one delivery attempt and roll the target (and
    /// notification) status forward.
    pub fn record_attempt(
        &self,
        tenant_id: &str,
        notification_id: &str,
        recipient_id: &str,
        channel: Channel,
        attempt: u32,
        result: &DeliveryResult,
        terminal: bool,
    ) {
        let key = (tenant_id.to_string(), notification_id.to_string());
        let Some(mut record) = self.records.get_mut(&key) else {
            return;
        };

        if let Some(target) = record
            .targets
            .iter_mut()
            .find(|t| t.recipient_id == recipient_id && t.channel == channel)
        {
            target.attempts = attempt;
            target.history.push(DeliveryAttempt {
                attempt,
                at: Utc::now(),
                success: result.success,
                error_code: result.error_code.clone(),
                error_message: result.error_message.clone(),
            });
            if result.success {
                target.status = TargetStatus::Delivered;
                target.provider_message_id = result.provider_message_id.clone();
            } else {
                target.last_error = result.error_message.clone();
                target.status = if terminal {
                    if result.retryable {
                        TargetStatus::DeadLettered
                    } else {
                        TargetStatus::Failed
                    }
                } else {
                    TargetStatus::Retrying
                };
            }
        }

        record.updated_at = Utc::now();
        roll_up_status(&mut record);
    }

    /// Mark a target terminal without a delivery attempt (no provider,
    /// validation failure).
    pub fn mark_target(
        &self,
        tenant_id: &str,
        notification_id: &str,
        recipient_id: &str,
        channel: Channel,
        status: TargetStatus,
        error: Option<String>,
    ) {
        let key = (tenant_id.to_string(), notification_id.to_string());
        let Some(mut record) = self.records.get_mut(&key) else {
            return;
        };
        if let Some(target) = record
            .targets
            .iter_mut()
            .find(|t| t.recipient_id == recipient_id && t.channel == channel)
        {
            target.status = status;
            target.last_error = error;
        }
        record.updated_at = Utc::now();
        roll_up_status(&mut record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the notification status from its targets once all are terminal:
/// Delivered if at least one succeeded and none hard-failed, DeadLettered if
/// any landed in the DLQ, otherwise Failed. Acknowledged is sticky.
fn roll_up_status(record: &mut NotificationRecord) {
    if record.acknowledged_at.is_some() || record.targets.is_empty() {
        return;
    }
    if !record.targets.iter().all(|t| t.status.is_terminal()) {
        return;
    }

    let any_delivered = record.targets.iter().any(|t| t.status == TargetStatus::Delivered);
    let any_dead = record.targets.iter().any(|t| t.status == TargetStatus::DeadLettered);
    let all_delivered = record.targets.iter().all(|t| t.status == TargetStatus::Delivered);

    record.status = if all_delivered {
        NotificationStatus::Delivered
    } else if any_dead {
        NotificationStatus::DeadLettered
    } else if any_delivered {
        NotificationStatus::Delivered
    } else {
        NotificationStatus::Failed
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(id: &str) -> NotificationRecord {
        NotificationRecord {
            event: NotificationEvent {
                id: id.into(),
                tenant_id: "t1".into(),
                event_type: "x".into(),
                priority: Default::default(),
                subject: None,
                content: None,
                title: None,
                icon_url: None,
                action_url: None,
                recipients: vec![],
                preferred_channels: vec![],
                scheduled_for: None,
                correlation_id: None,
                source: "test".into(),
                metadata: HashMap::new(),
                created_at: Utc::now(),
                template_id: None,
            },
            status: NotificationStatus::Enqueued,
            matched_rules: vec![],
            targets: vec![TargetRecord {
                recipient_id: "r1".into(),
                channel: Channel::Email,
                status: TargetStatus::Enqueued,
                attempts: 0,
                provider_message_id: None,
                last_error: None,
                history: vec![],
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }

    #[test]
    fn successful_attempt_rolls_up_to_delivered() {
        let store = NotificationStore::new();
        store.insert(record("n1"));

        store.record_attempt(
            "t1",
            "n1",
            "r1",
            Channel::Email,
            1,
            &DeliveryResult::delivered("p-1"),
            true,
        );

        let loaded = store.get("t1", "n1").unwrap();
        assert_eq!(loaded.status, NotificationStatus::Delivered);
        assert_eq!(loaded.targets[0].status, TargetStatus::Delivered);
        assert_eq!(loaded.targets[0].provider_message_id.as_deref(), Some("p-1"));
        assert_eq!(loaded.targets[0].history.len(), 1);
    }

    #[test]
    fn exhausted_retries_roll_up_to_dead_lettered() {
        let store = NotificationStore::new();
        store.insert(record("n1"));

        store.record_attempt(
            "t1",
            "n1",
            "r1",
            Channel::Email,
            1,
            &DeliveryResult::transient("HTTP_503", "boom"),
            false,
        );
        assert_eq!(store.get("t1", "n1").unwrap().status, NotificationStatus::Enqueued);
        assert_eq!(store.get("t1", "n1").unwrap().targets[0].status, TargetStatus::Retrying);

        store.record_attempt(
            "t1",
            "n1",
            "r1",
            Channel::Email,
            3,
            &DeliveryResult::transient("HTTP_503", "boom"),
            true,
        );
        let loaded = store.get("t1", "n1").unwrap();
        assert_eq!(loaded.status, NotificationStatus::DeadLettered);
        assert_eq!(loaded.targets[0].history.len(), 2);
    }

    #[test]
    fn acknowledgement_is_idempotent_and_sticky() {
        let store = NotificationStore::new();
        store.insert(record("n1"));

        assert!(store.acknowledge("t1", "n1", "alice"));
        let first = store.get("t1", "n1").unwrap().acknowledged_at;
        assert!(store.acknowledge("t1", "n1", "bob"));
        let loaded = store.get("t1", "n1").unwrap();
        assert_eq!(loaded.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(loaded.acknowledged_at, first);
        assert_eq!(loaded.status, NotificationStatus::Acknowledged);

        // delivery outcomes no longer move the status
        store.record_attempt(
            "t1",
            "n1",
            "r1",
            Channel::Email,
            1,
            &DeliveryResult::delivered("p"),
            true,
        );
        assert_eq!(store.get("t1", "n1").unwrap().status, NotificationStatus::Acknowledged);
    }

    #[test]
    fn unknown_notification_ack_returns_false() {
        let store = NotificationStore::new();
        assert!(!store.acknowledge("t1", "missing", "x"));
    }

    #[test]
    fn tenant_isolation_in_lookup() {
        let store = NotificationStore::new();
        store.insert(record("n1"));
        assert!(store.get("t2", "n1").is_none());
        assert_eq!(store.list_for_tenant("t1").len(), 1);
        assert!(store.list_for_tenant("t2").is_empty());
    }
}
