//! Slack Provider
//!
//! Posts a Slack incoming-webhook message to the recipient's webhook URL.
//! Slack answers 200 "ok" on success; 429 carries Retry-After and is
//! retryable, other 4xx (channel_not_found, invalid_payload) are permanent.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};

use crate::{NotificationProvider, ProviderError, ProviderHealth, Result, ValidationResult};

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

pub struct SlackProvider {
    client: Client,
}

impl SlackProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationProvider for SlackProvider {
    fn name(&self) -> &str {
        "slack-webhook"
    }

    fn channel(&self) -> Channel {
        Channel::Slack
    }

    fn validate(&self, _event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        match &recipient.webhook_url {
            None => ValidationResult::fail("recipient has no slack webhook url"),
            Some(_) => ValidationResult::ok(),
        }
    }

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult {
        let url = match &recipient.webhook_url {
            Some(url) => url,
            None => {
                return DeliveryResult::permanent("INVALID_RECIPIENT", "recipient has no slack webhook url")
            }
        };

        let text = match (&event.subject, &event.content) {
            (Some(subject), Some(content)) => format!("*{}*\n{}", subject, content),
            (Some(subject), None) => subject.clone(),
            (None, Some(content)) => content.clone(),
            (None, None) => event.event_type.clone(),
        };
        let message = SlackMessage {
            text: &text,
            icon_url: event.icon_url.as_deref(),
            username: event.title.as_deref(),
        };

        match self.client.post(url).json(&message).send().await {
            Ok(response) => {
                let status = response.status();
                let code = status.as_u16();
                if status.is_success() {
                    debug!(event_id = %event.id, "Slack message delivered");
                    DeliveryResult::delivered(format!("slack-{}", code))
                } else if code == 429 || status.is_server_error() {
                    warn!(event_id = %event.id, status = code, "Slack throttled/unavailable, will retry");
                    DeliveryResult::transient(format!("HTTP_{}", code), format!("slack returned {}", code))
                } else {
                    warn!(event_id = %event.id, status = code, "Slack rejected message");
                    DeliveryResult::permanent(format!("HTTP_{}", code), format!("slack returned {}", code))
                }
            }
            Err(e) if e.is_timeout() => DeliveryResult::transient("TIMEOUT", e.to_string()),
            Err(e) if e.is_connect() => DeliveryResult::transient("CONNECT", e.to_string()),
            Err(e) => DeliveryResult::transient("REQUEST", e.to_string()),
        }
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth {
            name: self.name().to_string(),
            healthy: true,
            message: None,
        }
    }
}
