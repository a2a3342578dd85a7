//! Push Provider
//!
//! FCM-legacy-shaped push sink: JSON POST with a server-key authorization
//! header. `legacy_auth_header` reproduces the historical malformed
//! `key =<key>` header value for deployments that depend on it; the default
//! emits the correct `key=<key>` form.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};
use nx_config::PushOptions;

use crate::{NotificationProvider, ProviderError, ProviderHealth, Result, ValidationResult};

#[derive(Debug, Serialize)]
struct PushPayload<'a> {
    to: &'a str,
    notification: PushNotification<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a std::collections::HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct PushNotification<'a> {
    title: Option<&'a str>,
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    click_action: Option<&'a str>,
}

pub struct PushProvider {
    client: Client,
    options: PushOptions,
}

impl PushProvider {
    pub fn new(options: PushOptions, timeout: Duration) -> Result<Self> {
        if options.server_key.is_empty() {
            return Err(ProviderError::Configuration("push server key is required".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, options })
    }

    fn authorization_value(&self) -> String {
        if self.options.legacy_auth_header {
            format!("key ={}", self.options.server_key)
        } else {
            format!("key={}", self.options.server_key)
        }
    }
}

#[async_trait]
impl NotificationProvider for PushProvider {
    fn name(&self) -> &str {
        "fcm-push"
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn validate(&self, _event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        match &recipient.device_id {
            None => ValidationResult::fail("recipient has no device id"),
            Some(_) => ValidationResult::ok(),
        }
    }

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult {
        let device_id = match &recipient.device_id {
            Some(id) => id.clone(),
            None => return DeliveryResult::permanent("INVALID_RECIPIENT", "recipient has no device id"),
        };

        let payload = PushPayload {
            to: &device_id,
            notification: PushNotification {
                title: event.title.as_deref().or(event.subject.as_deref()),
                body: event.content.as_deref(),
                icon: event.icon_url.as_deref(),
                click_action: event.action_url.as_deref(),
            },
            data: (!event.metadata.is_empty()).then_some(&event.metadata),
        };

        let request = self
            .client
            .post(&self.options.endpoint)
            .header("Authorization", self.authorization_value())
            .json(&payload);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let code = status.as_u16();
                if status.is_success() {
                    debug!(event_id = %event.id, "Push accepted");
                    DeliveryResult::delivered(format!("push-{}", code))
                } else if code == 401 || code == 403 {
                    // bad server key: configuration, not the recipient
                    warn!(event_id = %event.id, status = code, "Push rejected: bad credentials");
                    DeliveryResult::permanent(format!("HTTP_{}", code), "push authorization rejected")
                } else if code == 429 || status.is_server_error() {
                    DeliveryResult::transient(format!("HTTP_{}", code), format!("push endpoint returned {}", code))
                } else {
                    DeliveryResult::permanent(format!("HTTP_{}", code), format!("push endpoint returned {}", code))
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
            healthy: !self.options.server_key.is_empty(),
            message: None,
        }
    }
}
