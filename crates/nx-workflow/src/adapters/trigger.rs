//! Trigger-Source Adapters
//!
//! Trigger nodes head every workflow; their adapters shape the run input
//! into the trigger's output payload. `trigger.manual` passes the input
//! through; `notifyx.deliveryStatus` listens for delivery-status payloads
//! and filters on configured statuses.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};

/// Manual/API trigger: emits the run input unchanged.
pub struct ManualTriggerAdapter;

#[async_trait]
impl ConnectorAdapter for ManualTriggerAdapter {
    fn connector_type(&self) -> &str {
        "trigger.manual"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();
        ExecutionResult::ok(context.inputs, start.elapsed().as_millis() as u64)
    }
}

/// Delivery-status trigger: fires workflows off notification delivery
/// outcomes. Config: `{ statuses?: ["Delivered", "Failed", ...] }`. The
/// payload (run input) is expected to carry a `status` field; a payload
/// outside the configured statuses fails the trigger, ending the run
/// without executing downstream nodes.
pub struct DeliveryStatusTriggerAdapter;

#[async_trait]
impl ConnectorAdapter for DeliveryStatusTriggerAdapter {
    fn connector_type(&self) -> &str {
        "notifyx.deliveryStatus"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();
        let duration = |start: Instant| start.elapsed().as_millis() as u64;

        let status = context
            .inputs
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let accepted = match context.node_config.get("statuses").and_then(|v| v.as_array()) {
            Some(filter) => filter.iter().any(|s| s.as_str() == Some(status.as_str())),
            None => true,
        };

        if !accepted {
            return ExecutionResult::fail(
                format!("deliveryStatus trigger: status '{}' filtered out", status),
                duration(start),
            );
        }

        let mut output = context.inputs.clone();
        if let Value::Object(map) = &mut output {
            map.insert("triggerStatus".into(), json!(status));
        }
        ExecutionResult::ok(output, duration(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RunMetadata;
    use nx_common::Shutdown;
    use std::sync::Arc;

    fn context(config: Value, inputs: Value) -> AdapterContext {
        AdapterContext {
            tenant_id: "t1".into(),
            run_metadata: RunMetadata {
                run_id: "r1".into(),
                node_id: "n1".into(),
            },
            node_config: config,
            inputs,
            credential_secret: None,
            cancellation: Arc::new(Shutdown::new()),
        }
    }

    #[tokio::test]
    async fn manual_trigger_passes_input_through() {
        let result = ManualTriggerAdapter
            .execute(context(json!({}), json!({"x": 1})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!({"x": 1}));
    }

    #[tokio::test]
    async fn delivery_status_filter() {
        let accepted = DeliveryStatusTriggerAdapter
            .execute(context(
                json!({"statuses": ["Failed"]}),
                json!({"status": "Failed", "notificationId": "n1"}),
            ))
            .await;
        assert!(accepted.success);
        assert_eq!(accepted.output["triggerStatus"], "Failed");

        let filtered = DeliveryStatusTriggerAdapter
            .execute(context(
                json!({"statuses": ["Failed"]}),
                json!({"status": "Delivered"}),
            ))
            .await;
        assert!(!filtered.success);
    }
}
