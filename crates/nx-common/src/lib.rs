use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub mod expr;
pub mod logging;
pub mod shutdown;
pub mod substitution;

pub use shutdown::Shutdown;

// ============================================================================
// Identity & Tenancy
// ============================================================================

/// The authenticated caller attached to an inbound request.
///
/// Produced by the auth layer; immutable for the lifetime of one request.
/// Every entity in the system is owned by exactly one tenant, and all
/// service calls thread a `Principal` through explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: HashSet<String>,
    #[serde(default)]
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            roles: HashSet::new(),
            permissions: HashSet::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.is_system_admin()
    }

    /// System admins may read across tenants.
    pub fn is_system_admin(&self) -> bool {
        self.roles.contains("system-admin")
    }

    /// The tenant this principal may act on. `other` is allowed only for
    /// system admins.
    pub fn can_access_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id || self.is_system_admin()
    }
}

// ============================================================================
// Notification Domain
// ============================================================================

/// Delivery channels with built-in provider support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Webhook,
    Slack,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Webhook => "webhook",
            Channel::Slack => "slack",
        };
        write!(f, "{}", s)
    }
}

/// Message priority, determining dequeue order.
///
/// Dequeue is strictly Critical > High > Normal > Low; starvation of lower
/// priorities under sustained Critical traffic is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A notification target. Must carry at least one address field matching at
/// least one preferred channel of the event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecipient {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NotificationRecipient {
    /// Whether this recipient is addressable on the given channel.
    pub fn supports(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.email.is_some(),
            Channel::Sms => self.phone_number.is_some(),
            Channel::Push => self.device_id.is_some(),
            Channel::Webhook | Channel::Slack => self.webhook_url.is_some(),
        }
    }

    /// Recipient fields as a JSON object for template lookup.
    pub fn as_context(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".into(), serde_json::Value::String(self.id.clone()));
        if let Some(ref name) = self.name {
            map.insert("name".into(), serde_json::Value::String(name.clone()));
        }
        if let Some(ref email) = self.email {
            map.insert("email".into(), serde_json::Value::String(email.clone()));
        }
        if let Some(ref phone) = self.phone_number {
            map.insert("phoneNumber".into(), serde_json::Value::String(phone.clone()));
        }
        for (k, v) in &self.metadata {
            map.insert(k.clone(), v.clone());
        }
        serde_json::Value::Object(map)
    }
}

/// The core event that flows through the system.
///
/// Immutable once ingested; rule transforms produce new events or augment
/// metadata only. `(tenant_id, id)` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default)]
    pub recipients: Vec<NotificationRecipient>,
    #[serde(default)]
    pub preferred_channels: Vec<Channel>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub template_id: Option<String>,
}

impl NotificationEvent {
    /// Event fields plus metadata as a JSON object for predicate evaluation
    /// and template lookup. Metadata keys win over built-in fields.
    pub fn as_context(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".into(), serde_json::Value::String(self.id.clone()));
        map.insert("tenantId".into(), serde_json::Value::String(self.tenant_id.clone()));
        map.insert("eventType".into(), serde_json::Value::String(self.event_type.clone()));
        map.insert("priority".into(), serde_json::Value::String(self.priority.to_string()));
        map.insert("source".into(), serde_json::Value::String(self.source.clone()));
        if let Some(ref subject) = self.subject {
            map.insert("subject".into(), serde_json::Value::String(subject.clone()));
        }
        if let Some(ref correlation_id) = self.correlation_id {
            map.insert("correlationId".into(), serde_json::Value::String(correlation_id.clone()));
        }
        let mut metadata = serde_json::Map::new();
        for (k, v) in &self.metadata {
            metadata.insert(k.clone(), v.clone());
            map.insert(k.clone(), v.clone());
        }
        map.insert("metadata".into(), serde_json::Value::Object(metadata));
        serde_json::Value::Object(map)
    }
}

/// Lifecycle status of one ingested notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Enqueued,
    Delivered,
    Failed,
    Suppressed,
    Deferred,
    RateLimited,
    Acknowledged,
    DeadLettered,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::Suppressed
                | NotificationStatus::Acknowledged
                | NotificationStatus::DeadLettered
        )
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// One unit of deliverable work: a single (event, recipient, channel) target.
///
/// Lives in exactly one priority sub-queue until dequeued, then in the
/// in-flight map until acked or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    pub tenant_id: String,
    pub event: NotificationEvent,
    pub recipient: NotificationRecipient,
    pub channel: Channel,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl QueueMessage {
    pub fn new(event: NotificationEvent, recipient: NotificationRecipient, channel: Channel) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id.clone(),
            priority: event.priority,
            scheduled_for: event.scheduled_for,
            enqueued_at: Utc::now(),
            attempt: 1,
            event,
            recipient,
            channel,
        }
    }

    /// Whether the message is ready for dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map(|at| at <= now).unwrap_or(true)
    }
}

/// Terminal outcome of one delivery attempt for a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub retryable: bool,
}

impl DeliveryResult {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error_code: None,
            error_message: None,
            retryable: false,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            retryable: false,
        }
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Error kinds shared across subsystems. Kinds decide retry and surfacing
/// behaviour; see the per-crate error enums for the concrete sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad event/workflow/template. Surfaced to the caller, never retried.
    Validation,
    /// Rejected by the rate limiter. Recorded, not retried.
    RateLimited,
    /// Timeouts, 5xx, socket failures. Retried with backoff.
    TransientProvider,
    /// 4xx (except 429), invalid recipient, missing credential. Dead-lettered.
    PermanentProvider,
    /// Dependency resolver could not satisfy constraints.
    Resolution,
    /// Missing secret, unknown provider type.
    Configuration,
    /// Cooperative cancel. Recorded as cancelled, never retried.
    Cancelled,
    /// Unexpected failure; logged with correlation id, surfaced as 500.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient provider error [{code}]: {message}")]
    TransientProvider { code: String, message: String },

    #[error("Permanent provider error [{code}]: {message}")]
    PermanentProvider { code: String, message: String },

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NotifyError::Validation(_) => ErrorKind::Validation,
            NotifyError::RateLimited(_) => ErrorKind::RateLimited,
            NotifyError::TransientProvider { .. } => ErrorKind::TransientProvider,
            NotifyError::PermanentProvider { .. } => ErrorKind::PermanentProvider,
            NotifyError::Resolution(_) => ErrorKind::Resolution,
            NotifyError::Configuration(_) => ErrorKind::Configuration,
            NotifyError::Cancelled => ErrorKind::Cancelled,
            NotifyError::Expression(_) => ErrorKind::Validation,
            NotifyError::Serialization(_) => ErrorKind::Validation,
            NotifyError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> NotificationEvent {
        NotificationEvent {
            id: "n1".into(),
            tenant_id: "t1".into(),
            event_type: "welcome".into(),
            priority: Priority::Normal,
            subject: Some("Hi".into()),
            content: Some("Hello {{name}}".into()),
            title: None,
            icon_url: None,
            action_url: None,
            recipients: vec![],
            preferred_channels: vec![Channel::Email],
            scheduled_for: None,
            correlation_id: None,
            source: "test".into(),
            metadata: HashMap::from([("region".into(), serde_json::json!("eu"))]),
            created_at: Utc::now(),
            template_id: None,
        }
    }

    #[test]
    fn priority_dequeue_order() {
        assert_eq!(Priority::ALL[0], Priority::Critical);
        assert_eq!(Priority::ALL[3], Priority::Low);
        assert!(Priority::Critical < Priority::Low);
    }

    #[test]
    fn recipient_channel_support() {
        let recipient = NotificationRecipient {
            id: "r1".into(),
            email: Some("a@x".into()),
            ..Default::default()
        };
        assert!(recipient.supports(Channel::Email));
        assert!(!recipient.supports(Channel::Sms));
    }

    #[test]
    fn event_context_exposes_metadata_and_fields() {
        let ctx = sample_event().as_context();
        assert_eq!(ctx["eventType"], "welcome");
        assert_eq!(ctx["region"], "eu");
        assert_eq!(ctx["metadata"]["region"], "eu");
    }

    #[test]
    fn principal_tenant_access() {
        let p = Principal::new("t1", "u1");
        assert!(p.can_access_tenant("t1"));
        assert!(!p.can_access_tenant("t2"));

        let mut admin = Principal::new("t1", "u2");
        admin.roles.insert("system-admin".into());
        assert!(admin.can_access_tenant("t2"));
    }

    #[test]
    fn queue_message_due_check() {
        let event = sample_event();
        let recipient = NotificationRecipient::default();
        let mut msg = QueueMessage::new(event, recipient, Channel::Email);
        assert!(msg.is_due(Utc::now()));

        msg.scheduled_for = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!msg.is_due(Utc::now()));
    }
}
