//! SMTP Email Provider
//!
//! Delivers over SMTP via lettre's async transport. Transport-level and 5xx
//! SMTP failures are retryable; 5xx-class SMTP *rejections* of the recipient
//! (permanent per RFC 5321) are not.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};
use nx_config::SmtpOptions;

use crate::{NotificationProvider, ProviderError, ProviderHealth, Result, ValidationResult};

pub struct EmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl EmailProvider {
    pub fn new(options: &SmtpOptions) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&options.host)
            .map_err(|e| ProviderError::Configuration(format!("SMTP relay: {}", e)))?
            .port(options.port);

        if !options.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                options.username.clone(),
                options.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from_address: options.from_address.clone(),
        })
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn name(&self) -> &str {
        "smtp-email"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate(&self, _event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult {
        match &recipient.email {
            None => ValidationResult::fail("recipient has no email address"),
            Some(address) if !address.contains('@') => {
                ValidationResult::fail(format!("invalid email address '{}'", address))
            }
            Some(_) => ValidationResult::ok(),
        }
    }

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult {
        let to = match &recipient.email {
            Some(address) => address.clone(),
            None => return DeliveryResult::permanent("INVALID_RECIPIENT", "recipient has no email address"),
        };

        let message = Message::builder()
            .from(match self.from_address.parse() {
                Ok(from) => from,
                Err(e) => {
                    return DeliveryResult::permanent("BAD_FROM_ADDRESS", format!("from address: {}", e))
                }
            })
            .to(match to.parse() {
                Ok(to) => to,
                Err(e) => {
                    return DeliveryResult::permanent(
                        "INVALID_RECIPIENT",
                        format!("to address '{}': {}", to, e),
                    )
                }
            })
            .subject(event.subject.clone().unwrap_or_default())
            .header(ContentType::TEXT_PLAIN)
            .body(event.content.clone().unwrap_or_default());

        let message = match message {
            Ok(m) => m,
            Err(e) => return DeliveryResult::permanent("BAD_MESSAGE", e.to_string()),
        };

        match self.transport.send(message).await {
            Ok(response) => {
                debug!(
                    event_id = %event.id,
                    recipient = %to,
                    code = %response.code(),
                    "Email accepted by SMTP server"
                );
                DeliveryResult::delivered(response.code().to_string())
            }
            Err(e) => {
                warn!(event_id = %event.id, recipient = %to, error = %e, "SMTP send failed");
                if e.is_permanent() {
                    DeliveryResult::permanent("SMTP_PERMANENT", e.to_string())
                } else {
                    DeliveryResult::transient("SMTP_TRANSIENT", e.to_string())
                }
            }
        }
    }

    async fn health(&self) -> ProviderHealth {
        let healthy = self.transport.test_connection().await.unwrap_or(false);
        ProviderHealth {
            name: self.name().to_string(),
            healthy,
            message: (!healthy).then(|| "SMTP connection test failed".to_string()),
        }
    }
}
