//! SMS Provider
//!
//! Twilio-shaped REST sink: form-encoded POST with basic auth against the
//! configured messages endpoint. The wire format is treated as a pluggable
//! sink; any gateway implementing the same surface works.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};
use nx_config::SmsOptions;

use crate::{NotificationProvider, ProviderError, ProviderHealth, Result, ValidationResult};

pub struct SmsProvider {
    client: Client,
    options: SmsOptions,
}

impl SmsProvider {
    pub fn new(options: SmsOptions, timeout: Duration) -> Result<Self> {
        if options.endpoint.is_empty() {
            return Err(ProviderError::Configuration("sms endpoint is required".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, options })
    }
}

#[async_trait]
impl NotificationProvider for SmsProvider {
    fn name(&self) -> &str {
        "sms-gateway"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn validate(&self, _event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        match &recipient.phone_number {
            None => ValidationResult::fail("recipient has no phone number"),
            Some(number) if number.trim().is_empty() => {
                ValidationResult::fail("recipient phone number is empty")
            }
            Some(_) => ValidationResult::ok(),
        }
    }

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult {
        let to = match &recipient.phone_number {
            Some(number) => number.clone(),
            None => return DeliveryResult::permanent("INVALID_RECIPIENT", "recipient has no phone number"),
        };

        let body = event
            .content
            .clone()
            .or_else(|| event.subject.clone())
            .unwrap_or_default();

        let form = [
            ("To", to.as_str()),
            ("From", self.options.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let request = self
            .client
            .post(&self.options.endpoint)
            .basic_auth(&self.options.account_id, Some(&self.options.auth_token))
            .form(&form);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let code = status.as_u16();
                if status.is_success() {
                    let sid = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v.get("sid").and_then(|s| s.as_str()).map(String::from))
                        .unwrap_or_else(|| format!("sms-{}", code));
                    debug!(event_id = %event.id, "SMS accepted by gateway");
                    DeliveryResult::delivered(sid)
                } else if code == 429 || status.is_server_error() {
                    warn!(event_id = %event.id, status = code, "SMS gateway error, will retry");
                    DeliveryResult::transient(format!("HTTP_{}", code), format!("gateway returned {}", code))
                } else {
                    warn!(event_id = %event.id, status = code, "SMS rejected by gateway");
                    DeliveryResult::permanent(format!("HTTP_{}", code), format!("gateway returned {}", code))
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
            healthy: !self.options.endpoint.is_empty(),
            message: None,
        }
    }
}
