//! Set-Data Adapter
//!
//! Config: `{ assignments: [{ field, value, valueType? }] }`. Output is the
//! node's inputs with each assignment applied; `valueType` coerces the
//! substituted value (string | number | boolean | json).

use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};

pub struct SetDataAdapter;

#[async_trait]
impl ConnectorAdapter for SetDataAdapter {
    fn connector_type(&self) -> &str {
        "data.set"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();

        let mut output = match &context.inputs {
            Value::Object(map) => Value::Object(map.clone()),
            _ => Value::Object(serde_json::Map::new()),
        };

        let Some(assignments) = context
            .node_config
            .get("assignments")
            .and_then(|v| v.as_array())
        else {
            return ExecutionResult::fail(
                "data.set: 'assignments' is required",
                start.elapsed().as_millis() as u64,
            );
        };

        for assignment in assignments {
            let Some(field) = assignment.get("field").and_then(|v| v.as_str()) else {
                return ExecutionResult::fail(
                    "data.set: assignment missing 'field'",
                    start.elapsed().as_millis() as u64,
                );
            };
            let raw = assignment.get("value").cloned().unwrap_or(Value::Null);
            let substituted = match raw {
                Value::String(s) => {
                    nx_common::substitution::substitute_value(&s, &context.inputs).0
                }
                other => other,
            };
            let value_type = assignment
                .get("valueType")
                .and_then(|v| v.as_str())
                .unwrap_or("string");

            let coerced = match coerce(substituted, value_type) {
                Ok(v) => v,
                Err(e) => {
                    return ExecutionResult::fail(
                        format!("data.set: field '{}': {}", field, e),
                        start.elapsed().as_millis() as u64,
                    )
                }
            };

            if let Value::Object(map) = &mut output {
                map.insert(field.to_string(), coerced);
            }
        }

        ExecutionResult::ok(output, start.elapsed().as_millis() as u64)
    }
}

/// Coerce a substituted value to the declared type.
fn coerce(value: Value, value_type: &str) -> Result<Value, String> {
    match value_type {
        "string" => Ok(match value {
            Value::String(s) => Value::String(s),
            Value::Null => Value::String(String::new()),
            other => Value::String(other.to_string()),
        }),
        "number" => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("cannot coerce '{}' to number", s)),
            other => Err(format!("cannot coerce {} to number", other)),
        },
        "boolean" => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("cannot coerce '{}' to boolean", s)),
            },
            other => Err(format!("cannot coerce {} to boolean", other)),
        },
        "json" => match value {
            Value::String(s) => {
                serde_json::from_str(&s).map_err(|e| format!("invalid json: {}", e))
            }
            other => Ok(other),
        },
        other => Err(format!("unknown valueType '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RunMetadata;
    use nx_common::Shutdown;
    use serde_json::json;
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
    async fn assignments_extend_inputs_with_coercion() {
        let adapter = SetDataAdapter;
        let result = adapter
            .execute(context(
                json!({"assignments": [
                    {"field": "label", "value": "order {{orderId}}", "valueType": "string"},
                    {"field": "total", "value": "42.5", "valueType": "number"},
                    {"field": "urgent", "value": "true", "valueType": "boolean"},
                    {"field": "payload", "value": "{\"a\": 1}", "valueType": "json"}
                ]}),
                json!({"orderId": "o-1", "existing": "kept"}),
            ))
            .await;

        assert!(result.success);
        assert_eq!(result.output["label"], "order o-1");
        assert_eq!(result.output["total"], 42.5);
        assert_eq!(result.output["urgent"], true);
        assert_eq!(result.output["payload"], json!({"a": 1}));
        assert_eq!(result.output["existing"], "kept");
    }

    #[tokio::test]
    async fn bad_coercion_fails() {
        let adapter = SetDataAdapter;
        let result = adapter
            .execute(context(
                json!({"assignments": [
                    {"field": "n", "value": "not-a-number", "valueType": "number"}
                ]}),
                json!({}),
            ))
            .await;
        assert!(!result.success);
    }
}
