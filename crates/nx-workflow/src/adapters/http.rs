//! HTTP Request Adapter
//!
//! Config: `{ url, method?, headers?, body?, timeoutMs? }`, all string
//! values template-substituted. Output:
//! `{ status, body, headers }` with the body parsed as JSON when possible.
//! The credential secret, when present, is sent as a bearer token.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};
use crate::adapters::{config_str, config_value};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

pub struct HttpRequestAdapter {
    client: Client,
}

impl HttpRequestAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpRequestAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorAdapter for HttpRequestAdapter {
    fn connector_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        let Some(url) = config_str(&context.node_config, "url", &context.inputs) else {
            return ExecutionResult::fail("http.request: 'url' is required", elapsed(start));
        };
        let method = config_str(&context.node_config, "method", &context.inputs)
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();
        let timeout_ms = context
            .node_config
            .get("timeoutMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let method = match method.parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return ExecutionResult::fail(
                    format!("http.request: unsupported method '{}'", method),
                    elapsed(start),
                )
            }
        };

        let mut request = self
            .client
            .request(method, &url)
            .timeout(Duration::from_millis(timeout_ms));

        if let Some(Value::Object(headers)) = context.node_config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    let substituted =
                        nx_common::substitution::substitute(value, &context.inputs).text;
                    request = request.header(name, substituted);
                }
            }
        }
        if let Some(ref secret) = context.credential_secret {
            request = request.bearer_auth(secret);
        }
        if let Some(body) = config_value(&context.node_config, "body", &context.inputs) {
            request = request.json(&body);
        }

        debug!(
            run_id = %context.run_metadata.run_id,
            node_id = %context.run_metadata.node_id,
            url = %url,
            "Executing HTTP request node"
        );

        // the request future is dropped on cancellation, aborting the call
        let response = tokio::select! {
            r = request.send() => r,
            _ = context.cancellation.wait() => {
                return ExecutionResult::cancelled(elapsed(start));
            }
        };

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers: Value = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), json!(v)))
                    })
                    .collect::<serde_json::Map<String, Value>>()
                    .into();
                let text = response.text().await.unwrap_or_default();
                let body: Value =
                    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text));

                let output = json!({
                    "status": status,
                    "body": body,
                    "headers": headers,
                });
                if (200..400).contains(&status) {
                    ExecutionResult::ok(output, elapsed(start))
                } else {
                    let mut result = ExecutionResult::fail(
                        format!("http.request: status {}", status),
                        elapsed(start),
                    );
                    result.output = output;
                    result
                }
            }
            Err(e) => ExecutionResult::fail(format!("http.request: {}", e), elapsed(start)),
        }
    }
}
