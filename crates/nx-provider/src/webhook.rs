//! Webhook Provider
//!
//! HTTP POST of the rendered notification to the recipient's webhook URL,
//! with optional HMAC-SHA256 payload signing:
//! - X-NOTIFYX-SIGNATURE: hex HMAC over timestamp + body
//! - X-NOTIFYX-TIMESTAMP: ISO8601 with millisecond precision
//!
//! Status classification: 2xx delivered; 429 and 5xx retryable; other 4xx
//! permanent; timeouts and connection errors retryable.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};

use crate::{NotificationProvider, ProviderError, ProviderHealth, Result, ValidationResult};

pub const SIGNATURE_HEADER: &str = "X-NOTIFYX-SIGNATURE";
pub const TIMESTAMP_HEADER: &str = "X-NOTIFYX-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

/// Signature payload = timestamp + body, hex-encoded HMAC-SHA256.
fn sign_payload(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{}{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    notification_id: &'a str,
    tenant_id: &'a str,
    event_type: &'a str,
    subject: Option<&'a str>,
    body: Option<&'a str>,
    title: Option<&'a str>,
    action_url: Option<&'a str>,
    metadata: &'a std::collections::HashMap<String, serde_json::Value>,
}

pub struct WebhookProvider {
    client: Client,
    signing_secret: Option<String>,
}

impl WebhookProvider {
    pub fn new(timeout: Duration, signing_secret: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, signing_secret })
    }

    fn classify(event: &NotificationEvent, status: reqwest::StatusCode) -> DeliveryResult {
        let code = status.as_u16();
        if status.is_success() {
            debug!(event_id = %event.id, status = code, "Webhook delivered");
            return DeliveryResult::delivered(format!("http-{}", code));
        }
        if code == 429 || status.is_server_error() {
            warn!(event_id = %event.id, status = code, "Webhook target error, will retry");
            DeliveryResult::transient(format!("HTTP_{}", code), format!("webhook returned {}", code))
        } else {
            warn!(event_id = %event.id, status = code, "Webhook rejected permanently");
            DeliveryResult::permanent(format!("HTTP_{}", code), format!("webhook returned {}", code))
        }
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn name(&self) -> &str {
        "http-webhook"
    }

    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    fn validate(&self, _event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        match &recipient.webhook_url {
            None => ValidationResult::fail("recipient has no webhook url"),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                ValidationResult::fail(format!("invalid webhook url '{}'", url))
            }
            Some(_) => ValidationResult::ok(),
        }
    }

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult {
        let url = match &recipient.webhook_url {
            Some(url) => url,
            None => return DeliveryResult::permanent("INVALID_RECIPIENT", "recipient has no webhook url"),
        };

        let payload = WebhookPayload {
            notification_id: &event.id,
            tenant_id: &event.tenant_id,
            event_type: &event.event_type,
            subject: event.subject.as_deref(),
            body: event.content.as_deref(),
            title: event.title.as_deref(),
            action_url: event.action_url.as_deref(),
            metadata: &event.metadata,
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => return DeliveryResult::permanent("SERIALIZE", e.to_string()),
        };

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");

        if let Some(ref secret) = self.signing_secret {
            let (signature, timestamp) = sign_payload(&body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        match request.body(body).send().await {
            Ok(response) => Self::classify(event, response.status()),
            Err(e) if e.is_timeout() => DeliveryResult::transient("TIMEOUT", e.to_string()),
            Err(e) if e.is_connect() => DeliveryResult::transient("CONNECT", e.to_string()),
            Err(e) => DeliveryResult::transient("REQUEST", e.to_string()),
        }
    }

    async fn health(&self) -> ProviderHealth {
        // stateless client; healthy as long as it exists
        ProviderHealth {
            name: self.name().to_string(),
            healthy: true,
            message: None,
        }
    }
}
