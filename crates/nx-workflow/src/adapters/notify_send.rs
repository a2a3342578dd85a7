//! NotifyX Send Adapter
//!
//! The bridge from workflows into the notification orchestrator. Config:
//! `{ eventType, subject?, content?, priority?, channels?, recipients? }`,
//! template-substituted; recipients may also arrive structured via inputs
//! (`recipients` field). Output: `{ notificationId, status }`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use nx_common::{Channel, NotificationEvent, NotificationRecipient, Priority};
use nx_orchestrator::Orchestrator;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};
use crate::adapters::{config_str, config_value};

pub struct NotifySendAdapter {
    orchestrator: Arc<Orchestrator>,
}

impl NotifySendAdapter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ConnectorAdapter for NotifySendAdapter {
    fn connector_type(&self) -> &str {
        "notifyx.send"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();
        let duration = |start: Instant| start.elapsed().as_millis() as u64;

        let Some(event_type) = config_str(&context.node_config, "eventType", &context.inputs)
        else {
            return ExecutionResult::fail("notifyx.send: 'eventType' is required", duration(start));
        };

        let recipients_value = config_value(&context.node_config, "recipients", &context.inputs)
            .or_else(|| context.inputs.get("recipients").cloned())
            .unwrap_or(Value::Null);
        let recipients: Vec<NotificationRecipient> =
            match serde_json::from_value(recipients_value) {
                Ok(r) => r,
                Err(e) => {
                    return ExecutionResult::fail(
                        format!("notifyx.send: bad recipients: {}", e),
                        duration(start),
                    )
                }
            };

        let priority = config_str(&context.node_config, "priority", &context.inputs)
            .map(|p| match p.as_str() {
                "Critical" => Priority::Critical,
                "High" => Priority::High,
                "Low" => Priority::Low,
                _ => Priority::Normal,
            })
            .unwrap_or_default();

        let channels: Vec<Channel> = context
            .node_config
            .get("channels")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_else(|| vec![Channel::Email]);

        let event = NotificationEvent {
            id: String::new(), // assigned by the orchestrator
            tenant_id: context.tenant_id.clone(),
            event_type,
            priority,
            subject: config_str(&context.node_config, "subject", &context.inputs),
            content: config_str(&context.node_config, "content", &context.inputs),
            title: config_str(&context.node_config, "title", &context.inputs),
            icon_url: None,
            action_url: None,
            recipients,
            preferred_channels: channels,
            scheduled_for: None,
            correlation_id: Some(context.run_metadata.run_id.clone()),
            source: format!("workflow:{}", context.run_metadata.node_id),
            metadata: HashMap::from([(
                "runId".to_string(),
                json!(context.run_metadata.run_id),
            )]),
            created_at: Utc::now(),
            template_id: config_str(&context.node_config, "templateId", &context.inputs),
        };

        match self.orchestrator.send(event) {
            Ok(outcome) => ExecutionResult::ok(
                json!({
                    "notificationId": outcome.notification_id,
                    "status": outcome.status,
                    "targets": outcome.per_target_results.len(),
                }),
                duration(start),
            ),
            Err(e) => ExecutionResult::fail(format!("notifyx.send: {}", e), duration(start)),
        }
    }
}
