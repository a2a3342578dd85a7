//! Provider Registry
//!
//! Maps channels to pluggable delivery providers. Each provider exposes
//! validate/send/health/configure; the registry hands the orchestrator the
//! first available provider for a channel. `DeliveryResult.retryable`
//! controls the worker pool's retry loop; providers return structured
//! results and never panic across the boundary.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use nx_common::{Channel, DeliveryResult, NotificationEvent, NotificationRecipient};

pub mod email;
pub mod push;
pub mod slack;
pub mod sms;
pub mod webhook;

pub use email::EmailProvider;
pub use push::PushProvider;
pub use slack::SlackProvider;
pub use sms::SmsProvider;
pub use webhook::WebhookProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider configuration error: {0}")]
    Configuration(String),

    #[error("No provider registered for channel {0}")]
    NoProvider(Channel),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Pre-send validation outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self { valid: true, errors: Vec::new() }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
        }
    }
}

/// Provider health for the /health surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// A pluggable channel sink.
///
/// `send` must return a structured result; only programmer errors may panic.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    /// Cheap static checks (addressability, required config). A failed
    /// validation skips `send` entirely.
    fn validate(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> ValidationResult;

    async fn send(&self, event: &NotificationEvent, recipient: &NotificationRecipient) -> DeliveryResult;

    async fn health(&self) -> ProviderHealth;

    /// Apply channel configuration at runtime. Default: not configurable.
    fn configure(&self, _config: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Channel -> ordered provider list. Reads take a snapshot; writes
/// replace the whole slot (registration happens at composition time and on
/// operator reconfiguration only).
pub struct ProviderRegistry {
    providers: RwLock<HashMap<Channel, Vec<Arc<dyn NotificationProvider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn NotificationProvider>) {
        info!(
            provider = provider.name(),
            channel = %provider.channel(),
            "Registering notification provider"
        );
        self.providers
            .write()
            .entry(provider.channel())
            .or_default()
            .push(provider);
    }

    /// All providers for a channel, in registration order.
    pub fn providers_for(&self, channel: Channel) -> Vec<Arc<dyn NotificationProvider>> {
        self.providers
            .read()
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// The first registered provider for a channel.
    pub fn first_for(&self, channel: Channel) -> Option<Arc<dyn NotificationProvider>> {
        self.providers
            .read()
            .get(&channel)
            .and_then(|list| list.first().cloned())
    }

    pub fn has_provider(&self, channel: Channel) -> bool {
        self.providers
            .read()
            .get(&channel)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.providers.read().keys().copied().collect()
    }

    /// Aggregate health of every registered provider.
    pub async fn health(&self) -> Vec<ProviderHealth> {
        let providers: Vec<Arc<dyn NotificationProvider>> = self
            .providers
            .read()
            .values()
            .flatten()
            .cloned()
            .collect();

        let mut reports = Vec::with_capacity(providers.len());
        for provider in providers {
            reports.push(provider.health().await);
        }
        reports
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
