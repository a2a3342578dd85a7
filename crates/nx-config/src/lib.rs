//! NotifyX Configuration System
//!
//! TOML-based configuration with environment variable override support.
//! Environment variables use the `NOTIFYX__SECTION__FIELD` convention
//! (double underscore as the section separator); JWT settings use the
//! `JWT__*` prefix.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpOptions,
    pub queue: QueueOptions,
    pub worker: WorkerOptions,
    pub retry: RetryOptions,
    pub rate_limit: RateLimitOptions,
    pub jwt: JwtOptions,
    pub engine: EngineOptions,
    pub provider: ProviderOptions,

    /// Tenant applied to unauthenticated dev-mode requests
    pub default_tenant_id: String,

    /// Enable development mode (permissive auth, verbose errors)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpOptions::default(),
            queue: QueueOptions::default(),
            worker: WorkerOptions::default(),
            retry: RetryOptions::default(),
            rate_limit: RateLimitOptions::default(),
            jwt: JwtOptions::default(),
            engine: EngineOptions::default(),
            provider: ProviderOptions::default(),
            default_tenant_id: "default".to_string(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: vec!["http://localhost:4200".to_string()],
        }
    }
}

/// Priority queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Maximum messages per priority sub-queue; enqueue fails beyond this
    pub max_depth: usize,
    /// Worker poll interval when the queue is idle, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum retained dead-letter entries (oldest evicted first)
    pub dlq_max_entries: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_depth: 100_000,
            poll_interval_ms: 100,
            dlq_max_entries: 10_000,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Number of dispatch workers; 0 means the CPU count
    pub max_concurrent: usize,
    /// Cooperative shutdown deadline in seconds
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerOptions {
    /// Effective worker count with the CPU-count default applied.
    pub fn effective_workers(&self) -> usize {
        if self.max_concurrent > 0 {
            self.max_concurrent
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// Delivery retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Apply up to 20% random jitter to computed delays
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Token-bucket rate limit configuration.
///
/// A value of 0 disables the corresponding bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
    pub tenant_per_minute: u32,
    pub tenant_per_hour: u32,
    pub tenant_per_day: u32,
    pub recipient_per_minute: u32,
    pub recipient_per_hour: u32,
    pub recipient_per_day: u32,
    /// Route rate-limited events to the DLQ instead of dropping the outcome
    pub dead_letter_on_reject: bool,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            tenant_per_minute: 600,
            tenant_per_hour: 10_000,
            tenant_per_day: 100_000,
            recipient_per_minute: 60,
            recipient_per_hour: 1_000,
            recipient_per_day: 10_000,
            dead_letter_on_reject: false,
        }
    }
}

/// JWT validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtOptions {
    pub secret_key: String,
    pub issuer: String,
    pub audience: String,
    pub expiry_minutes: u64,
}

impl Default for JwtOptions {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            issuer: "notifyx".to_string(),
            audience: "notifyx-api".to_string(),
            expiry_minutes: 60,
        }
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Default per-node timeout in milliseconds
    pub default_node_timeout_ms: u64,
    /// Per-run deadline in seconds
    pub run_timeout_secs: u64,
    /// Loop node iteration ceiling
    pub max_loop_iterations: u32,
    /// Nesting ceiling for sub-workflow runs
    pub max_sub_workflow_depth: u32,
    /// Run event bus buffer per subscriber
    pub event_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: 30_000,
            run_timeout_secs: 1_800,
            max_loop_iterations: 1_000,
            max_sub_workflow_depth: 8,
            event_buffer: 256,
        }
    }
}

/// Channel provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderOptions {
    pub smtp: SmtpOptions,
    pub push: PushOptions,
    pub sms: SmsOptions,
    pub request_timeout_secs: u64,
}

/// SMTP email provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            from_address: "notifications@notifyx.local".to_string(),
        }
    }
}

/// Push (FCM-style) provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushOptions {
    pub endpoint: String,
    pub server_key: String,
    /// Emit the legacy malformed `key =<key>` authorization header instead
    /// of the correct `key=<key>` form
    pub legacy_auth_header: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            server_key: String::new(),
            legacy_auth_header: false,
        }
    }
}

/// SMS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsOptions {
    pub endpoint: String,
    pub account_id: String,
    pub auth_token: String,
    pub from_number: String,
}

impl Default for SmsOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            account_id: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        if !self.dev_mode && self.jwt.secret_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "jwt.secret_key is required outside dev mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_in_dev_mode() {
        let mut config = AppConfig::default();
        config.dev_mode = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_jwt_secret_rejected_in_prod() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_default_uses_cpu_count() {
        let options = WorkerOptions::default();
        assert!(options.effective_workers() >= 1);

        let fixed = WorkerOptions { max_concurrent: 7, ..Default::default() };
        assert_eq!(fixed.effective_workers(), 7);
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            dev_mode = true

            [retry]
            max_attempts = 5

            [rate_limit]
            tenant_per_minute = 10
            "#,
        )
        .unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.rate_limit.tenant_per_minute, 10);
        // untouched sections keep defaults
        assert_eq!(config.queue.max_depth, 100_000);
    }
}
