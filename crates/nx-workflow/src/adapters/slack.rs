//! Slack Adapter
//!
//! Config: `{ webhookUrl?, text, channel? }`, template-substituted. The
//! webhook URL may come from the config or from the node's credential
//! secret. Output: `{ delivered, status }`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::{Duration, Instant};

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};
use crate::adapters::config_str;

pub struct SlackAdapter {
    client: Client,
}

impl SlackAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for SlackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorAdapter for SlackAdapter {
    fn connector_type(&self) -> &str {
        "slack.send"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();

        let url = config_str(&context.node_config, "webhookUrl", &context.inputs)
            .or_else(|| context.credential_secret.clone());
        let Some(url) = url else {
            return ExecutionResult::fail(
                "slack.send: no webhook url (config or credential)",
                start.elapsed().as_millis() as u64,
            );
        };
        let Some(text) = config_str(&context.node_config, "text", &context.inputs) else {
            return ExecutionResult::fail(
                "slack.send: 'text' is required",
                start.elapsed().as_millis() as u64,
            );
        };

        let mut payload = json!({ "text": text });
        if let Some(channel) = config_str(&context.node_config, "channel", &context.inputs) {
            payload["channel"] = json!(channel);
        }

        let response = tokio::select! {
            r = self.client.post(&url).json(&payload).send() => r,
            _ = context.cancellation.wait() => {
                return ExecutionResult::cancelled(start.elapsed().as_millis() as u64);
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    ExecutionResult::ok(json!({ "delivered": true, "status": status }), duration_ms)
                } else {
                    ExecutionResult::fail(format!("slack.send: status {}", status), duration_ms)
                }
            }
            Err(e) => ExecutionResult::fail(format!("slack.send: {}", e), duration_ms),
        }
    }
}
