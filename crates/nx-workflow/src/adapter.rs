//! Connector Adapter Contract
//!
//! Adapters implement a connector's `execute` operation. They are
//! deterministic functions of `(node_config, inputs, credential_secret)`
//! apart from their declared I/O, return structured results, observe the
//! cancellation handle during their own I/O, and never throw across the
//! boundary.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use nx_common::Shutdown;

/// Identifies the invoking run/node for logging and idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: String,
    pub node_id: String,
}

/// Everything an adapter invocation receives.
pub struct AdapterContext {
    pub tenant_id: String,
    pub run_metadata: RunMetadata,
    /// The node's `config` value, template tokens not yet substituted
    pub node_config: serde_json::Value,
    /// Structured inputs: run input, globals, and upstream outputs
    pub inputs: serde_json::Value,
    /// Decrypted secret, present only for this invocation
    pub credential_secret: Option<String>,
    pub cancellation: Arc<Shutdown>,
}

/// Structured adapter outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionResult {
    pub fn ok(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            duration_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn fail(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error_message: Some(message.into()),
            duration_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn cancelled(duration_ms: u64) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error_message: Some("cancelled".into()),
            duration_ms,
            metadata: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait ConnectorAdapter: Send + Sync {
    /// Connector id this adapter implements.
    fn connector_type(&self) -> &str;

    async fn execute(&self, context: AdapterContext) -> ExecutionResult;
}

/// Type -> adapter map. Adapters are stateless singletons; registering the
/// same type twice replaces the previous adapter.
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ConnectorAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ConnectorAdapter>) {
        self.adapters
            .insert(adapter.connector_type().to_string(), adapter);
    }

    pub fn get(&self, connector_type: &str) -> Option<Arc<dyn ConnectorAdapter>> {
        self.adapters.get(connector_type).map(|a| a.clone())
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.adapters.contains_key(connector_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
