//! Escalation Schedule
//!
//! Pending escalations registered by rule evaluation. Each entry fires once
//! its `scheduled_for` passes, unless the original notification was
//! acknowledged first. Draining is done by the orchestrator's scheduler
//! tick; firing builds a follow-up event routed through the normal send
//! path (including the rate limiter).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use nx_common::NotificationRecipient;
use nx_rules::EscalationRequest;

#[derive(Debug, Clone)]
pub struct PendingEscalation {
    pub original_event_id: String,
    pub tenant_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub recipients: Vec<NotificationRecipient>,
}

pub struct EscalationSchedule {
    // keyed by original notification id
    pending: DashMap<(String, String), Vec<PendingEscalation>>,
}

impl EscalationSchedule {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub fn register(&self, request: EscalationRequest) {
        let key = (request.tenant_id.clone(), request.original_event_id.clone());
        self.pending.entry(key).or_default().push(PendingEscalation {
            original_event_id: request.original_event_id,
            tenant_id: request.tenant_id,
            scheduled_for: request.scheduled_for,
            recipients: request.recipients,
        });
    }

    /// Cancel every pending escalation for a notification (on ack).
    pub fn cancel(&self, tenant_id: &str, notification_id: &str) -> usize {
        match self
            .pending
            .remove(&(tenant_id.to_string(), notification_id.to_string()))
        {
            Some((_, entries)) => {
                debug!(
                    tenant_id = %tenant_id,
                    notification_id = %notification_id,
                    cancelled = entries.len(),
                    "Escalations cancelled by acknowledgement"
                );
                entries.len()
            }
            None => 0,
        }
    }

    /// Remove and return all escalations due at `now`.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<PendingEscalation> {
        let mut due = Vec::new();
        let keys: Vec<(String, String)> = self.pending.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            if let Some(mut entry) = self.pending.get_mut(&key) {
                let (ready, waiting): (Vec<_>, Vec<_>) =
                    entry.drain(..).partition(|e| e.scheduled_for <= now);
                *entry = waiting;
                due.extend(ready);
            }
            // drop empty slots so cancel/len stay meaningful
            self.pending.remove_if(&key, |_, v| v.is_empty());
        }
        due
    }

    pub fn len(&self) -> usize {
        self.pending.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EscalationSchedule {
    fn default() -> Self {
        Self::new()
    }
}
