//! Notification Orchestrator
//!
//! The ingest pipeline: rules -> rate limiter -> template render -> one
//! queue message per `(recipient, channel)` target with a registered
//! provider. Scheduled escalations and aggregate flushes re-enter through
//! the same path on the scheduler tick, so tenant limits apply uniformly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use nx_common::{
    Channel, NotificationEvent, NotificationStatus, NotifyError, QueueMessage, Result,
};
use nx_limiter::RateLimiter;
use nx_provider::ProviderRegistry;
use nx_queue::{DeadLetterStore, PriorityQueue};
use nx_rules::{RuleEngine, Verdict};
use nx_template::TemplateService;

use crate::escalation::EscalationSchedule;
use crate::store::{NotificationRecord, NotificationStore, TargetRecord, TargetStatus};

/// Aggregate ingest status returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Enqueued,
    Suppressed,
    Deferred,
    RateLimited,
    /// No target could be enqueued
    Failed,
    /// Already ingested under the same `(tenant, id)` key
    Duplicate,
}

/// Per-target ingest outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResult {
    pub recipient_id: String,
    pub channel: Channel,
    pub enqueued: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of one `send` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub notification_id: String,
    pub status: SendStatus,
    pub per_target_results: Vec<TargetResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub struct Orchestrator {
    queue: Arc<PriorityQueue>,
    dlq: Arc<DeadLetterStore>,
    limiter: Arc<RateLimiter>,
    rules: Arc<RuleEngine>,
    templates: Arc<TemplateService>,
    providers: Arc<ProviderRegistry>,
    store: Arc<NotificationStore>,
    escalations: Arc<EscalationSchedule>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PriorityQueue>,
        dlq: Arc<DeadLetterStore>,
        limiter: Arc<RateLimiter>,
        rules: Arc<RuleEngine>,
        templates: Arc<TemplateService>,
        providers: Arc<ProviderRegistry>,
        store: Arc<NotificationStore>,
    ) -> Self {
        Self {
            queue,
            dlq,
            limiter,
            rules,
            templates,
            providers,
            store,
            escalations: Arc::new(EscalationSchedule::new()),
        }
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn escalations(&self) -> &Arc<EscalationSchedule> {
        &self.escalations
    }

    /// Ingest one event.
    pub fn send(&self, mut event: NotificationEvent) -> Result<SendOutcome> {
        if event.tenant_id.is_empty() {
            return Err(NotifyError::Validation("tenantId is required".into()));
        }
        if event.event_type.is_empty() {
            return Err(NotifyError::Validation("eventType is required".into()));
        }
        if event.recipients.is_empty() {
            return Err(NotifyError::Validation("at least one recipient is required".into()));
        }
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        event.created_at = Utc::now();

        // (tenant, id) is the idempotency key
        if self.store.contains(&event.tenant_id, &event.id) {
            debug!(
                tenant_id = %event.tenant_id,
                notification_id = %event.id,
                "Duplicate ingest, returning existing record"
            );
            return Ok(SendOutcome {
                notification_id: event.id,
                status: SendStatus::Duplicate,
                per_target_results: Vec::new(),
                warnings: Vec::new(),
            });
        }

        // Rules
        let evaluation = self.rules.evaluate(&event);
        let event = evaluation.event;
        for escalation in evaluation.escalations {
            self.escalations.register(escalation);
        }

        match evaluation.verdict {
            Verdict::Suppress => {
                info!(
                    tenant_id = %event.tenant_id,
                    notification_id = %event.id,
                    matched = ?evaluation.matched_rules,
                    "Notification suppressed by rules"
                );
                self.record(&event, NotificationStatus::Suppressed, &evaluation.matched_rules, vec![]);
                return Ok(SendOutcome {
                    notification_id: event.id,
                    status: SendStatus::Suppressed,
                    per_target_results: Vec::new(),
                    warnings: Vec::new(),
                });
            }
            Verdict::Defer => {
                debug!(
                    tenant_id = %event.tenant_id,
                    notification_id = %event.id,
                    "Notification deferred into aggregation bucket"
                );
                self.record(&event, NotificationStatus::Deferred, &evaluation.matched_rules, vec![]);
                return Ok(SendOutcome {
                    notification_id: event.id,
                    status: SendStatus::Deferred,
                    per_target_results: Vec::new(),
                    warnings: Vec::new(),
                });
            }
            Verdict::Send => {}
        }

        // Rate limiter
        let recipient_ids: Vec<&str> = event.recipients.iter().map(|r| r.id.as_str()).collect();
        let keys = self.limiter.keys_for(&event.tenant_id, &recipient_ids);
        if !self.limiter.try_acquire(&keys) {
            warn!(
                tenant_id = %event.tenant_id,
                notification_id = %event.id,
                "Notification rejected by rate limiter"
            );
            self.record(&event, NotificationStatus::RateLimited, &evaluation.matched_rules, vec![]);
            if self.limiter.dead_letter_on_reject() {
                for (recipient, channel) in self.eligible_targets(&event) {
                    let message = QueueMessage::new(event.clone(), recipient, channel);
                    self.dlq.record(message, "rate limited");
                }
            }
            return Ok(SendOutcome {
                notification_id: event.id,
                status: SendStatus::RateLimited,
                per_target_results: Vec::new(),
                warnings: Vec::new(),
            });
        }

        // Fan out one queue message per target
        let mut targets = Vec::new();
        let mut results = Vec::new();
        let mut warnings = Vec::new();

        for recipient in &event.recipients {
            for channel in &event.preferred_channels {
                let channel = *channel;
                let Some(provider) = self.providers.first_for(channel) else {
                    results.push(TargetResult {
                        recipient_id: recipient.id.clone(),
                        channel,
                        enqueued: false,
                        reason: Some("no provider for channel".into()),
                    });
                    continue;
                };

                if !recipient.supports(channel) {
                    results.push(TargetResult {
                        recipient_id: recipient.id.clone(),
                        channel,
                        enqueued: false,
                        reason: Some("recipient not addressable on channel".into()),
                    });
                    targets.push(target_record(recipient, channel, TargetStatus::ValidationFailed));
                    continue;
                }

                let validation = provider.validate(&event, recipient);
                if !validation.valid {
                    let reason = validation.errors.join("; ");
                    results.push(TargetResult {
                        recipient_id: recipient.id.clone(),
                        channel,
                        enqueued: false,
                        reason: Some(reason),
                    });
                    targets.push(target_record(recipient, channel, TargetStatus::ValidationFailed));
                    continue;
                }

                // render per recipient: the queued event carries the final
                // subject/body the provider will send
                let rendered = match &event.template_id {
                    Some(template_id) => match self.templates.render(&event, recipient, template_id) {
                        Ok(r) => r,
                        Err(e) => {
                            return Err(NotifyError::Validation(format!("template: {}", e)));
                        }
                    },
                    None => self.templates.render_inline(&event, recipient),
                };
                warnings.extend(rendered.warnings.clone());

                let mut message_event = event.clone();
                message_event.subject = rendered.subject.clone();
                message_event.content = Some(rendered.body.clone());

                let message = QueueMessage::new(message_event, recipient.clone(), channel);
                if self.queue.enqueue(message) {
                    results.push(TargetResult {
                        recipient_id: recipient.id.clone(),
                        channel,
                        enqueued: true,
                        reason: None,
                    });
                    targets.push(target_record(recipient, channel, TargetStatus::Enqueued));
                } else {
                    results.push(TargetResult {
                        recipient_id: recipient.id.clone(),
                        channel,
                        enqueued: false,
                        reason: Some("queue at capacity".into()),
                    });
                    targets.push(target_record(recipient, channel, TargetStatus::Failed));
                }
            }
        }

        let any_enqueued = results.iter().any(|r| r.enqueued);
        let status = if any_enqueued {
            NotificationStatus::Enqueued
        } else {
            NotificationStatus::Failed
        };
        self.record(&event, status, &evaluation.matched_rules, targets);

        info!(
            tenant_id = %event.tenant_id,
            notification_id = %event.id,
            enqueued = results.iter().filter(|r| r.enqueued).count(),
            skipped = results.iter().filter(|r| !r.enqueued).count(),
            "Notification ingested"
        );

        Ok(SendOutcome {
            notification_id: event.id,
            status: if any_enqueued { SendStatus::Enqueued } else { SendStatus::Failed },
            per_target_results: results,
            warnings,
        })
    }

    /// Idempotent acknowledgement; cancels pending escalations.
    pub fn ack(&self, tenant_id: &str, notification_id: &str, by: &str) -> Result<()> {
        if !self.store.acknowledge(tenant_id, notification_id, by) {
            return Err(NotifyError::Validation(format!(
                "unknown notification '{}'",
                notification_id
            )));
        }
        let cancelled = self.escalations.cancel(tenant_id, notification_id);
        info!(
            tenant_id = %tenant_id,
            notification_id = %notification_id,
            acknowledged_by = %by,
            escalations_cancelled = cancelled,
            "Notification acknowledged"
        );
        Ok(())
    }

    /// Scheduler tick: fire due escalations (unless acknowledged) and flush
    /// closed aggregation windows, re-entering `send` for each.
    pub fn run_scheduler_tick(&self) -> usize {
        let now = Utc::now();
        let mut dispatched = 0;

        for escalation in self.escalations.drain_due(now) {
            if self
                .store
                .is_acknowledged(&escalation.tenant_id, &escalation.original_event_id)
            {
                continue;
            }
            let Some(original) = self
                .store
                .get(&escalation.tenant_id, &escalation.original_event_id)
            else {
                continue;
            };

            let mut event = original.event.clone();
            event.id = uuid::Uuid::new_v4().to_string();
            event.event_type = format!("{}.escalated", original.event.event_type);
            event.recipients = escalation.recipients;
            event.scheduled_for = None;
            event
                .metadata
                .insert("escalatedFrom".into(), serde_json::json!(escalation.original_event_id));

            match self.send(event) {
                Ok(_) => dispatched += 1,
                Err(e) => warn!(error = %e, "Escalation dispatch failed"),
            }
        }

        for event in self.rules.drain_expired_aggregates(now) {
            match self.send(event) {
                Ok(_) => dispatched += 1,
                Err(e) => warn!(error = %e, "Aggregate flush dispatch failed"),
            }
        }

        dispatched
    }

    fn eligible_targets(
        &self,
        event: &NotificationEvent,
    ) -> Vec<(nx_common::NotificationRecipient, Channel)> {
        let mut targets = Vec::new();
        for recipient in &event.recipients {
            for channel in &event.preferred_channels {
                if self.providers.has_provider(*channel) && recipient.supports(*channel) {
                    targets.push((recipient.clone(), *channel));
                }
            }
        }
        targets
    }

    fn record(
        &self,
        event: &NotificationEvent,
        status: NotificationStatus,
        matched_rules: &[String],
        targets: Vec<TargetRecord>,
    ) {
        self.store.insert(NotificationRecord {
            event: event.clone(),
            status,
            matched_rules: matched_rules.to_vec(),
            targets,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
        });
    }
}

fn target_record(
    recipient: &nx_common::NotificationRecipient,
    channel: Channel,
    status: TargetStatus,
) -> TargetRecord {
    TargetRecord {
        recipient_id: recipient.id.clone(),
        channel,
        status,
        attempts: 0,
        provider_message_id: None,
        last_error: None,
        history: Vec::new(),
    }
}
