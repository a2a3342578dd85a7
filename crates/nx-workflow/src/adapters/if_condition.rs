//! If-Condition Adapter
//!
//! Config: `{ left, operator, right?, caseSensitive? }` with operators
//! equals | notEquals | contains | regex | greaterThan | lessThan |
//! isEmpty. Left/right are template-substituted. Output: `{ result }`,
//! which the engine uses to pick true/false branch edges.

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use std::time::Instant;

use crate::adapter::{AdapterContext, ConnectorAdapter, ExecutionResult};
use crate::adapters::config_value;

pub struct IfConditionAdapter;

#[async_trait]
impl ConnectorAdapter for IfConditionAdapter {
    fn connector_type(&self) -> &str {
        "logic.if"
    }

    async fn execute(&self, context: AdapterContext) -> ExecutionResult {
        let start = Instant::now();

        let Some(operator) = context.node_config.get("operator").and_then(|v| v.as_str()) else {
            return ExecutionResult::fail(
                "logic.if: 'operator' is required",
                start.elapsed().as_millis() as u64,
            );
        };
        let case_sensitive = context
            .node_config
            .get("caseSensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let left = config_value(&context.node_config, "left", &context.inputs)
            .unwrap_or(Value::Null);
        let right = config_value(&context.node_config, "right", &context.inputs)
            .unwrap_or(Value::Null);

        let verdict = match evaluate(operator, &left, &right, case_sensitive) {
            Ok(v) => v,
            Err(e) => {
                return ExecutionResult::fail(
                    format!("logic.if: {}", e),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        ExecutionResult::ok(json!({ "result": verdict }), start.elapsed().as_millis() as u64)
    }
}

fn evaluate(operator: &str, left: &Value, right: &Value, case_sensitive: bool) -> Result<bool, String> {
    match operator {
        "equals" => Ok(loose_eq(left, right, case_sensitive)),
        "notEquals" => Ok(!loose_eq(left, right, case_sensitive)),
        "contains" => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => {
                if case_sensitive {
                    Ok(haystack.contains(needle.as_str()))
                } else {
                    Ok(haystack.to_lowercase().contains(&needle.to_lowercase()))
                }
            }
            (Value::Array(items), needle) => {
                Ok(items.iter().any(|item| loose_eq(item, needle, case_sensitive)))
            }
            _ => Ok(false),
        },
        "regex" => {
            let (Value::String(input), Value::String(pattern)) = (left, right) else {
                return Err("regex requires string operands".into());
            };
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| format!("bad pattern: {}", e))?;
            Ok(regex.is_match(input))
        }
        "greaterThan" => compare_numbers(left, right).map(|ordering| ordering == std::cmp::Ordering::Greater),
        "lessThan" => compare_numbers(left, right).map(|ordering| ordering == std::cmp::Ordering::Less),
        "isEmpty" => Ok(match left {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }),
        other => Err(format!("unknown operator '{}'", other)),
    }
}

fn loose_eq(left: &Value, right: &Value, case_sensitive: bool) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) if !case_sensitive => {
            a.to_lowercase() == b.to_lowercase()
        }
        _ => {
            if left == right {
                return true;
            }
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
    }
}

fn compare_numbers(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or_else(|| "incomparable numbers".to_string()),
        _ => Err("comparison requires numeric operands".to_string()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RunMetadata;
    use nx_common::Shutdown;
    use std::sync::Arc;

    fn run(config: Value, inputs: Value) -> ExecutionResult {
        let adapter = IfConditionAdapter;
        let context = AdapterContext {
            tenant_id: "t1".into(),
            run_metadata: RunMetadata {
                run_id: "r1".into(),
                node_id: "n1".into(),
            },
            node_config: config,
            inputs,
            credential_secret: None,
            cancellation: Arc::new(Shutdown::new()),
        };
        futures::executor::block_on(adapter.execute(context))
    }

    #[test]
    fn equals_with_template_and_coercion() {
        let result = run(
            json!({"left": "{{x}}", "operator": "equals", "right": 1}),
            json!({"x": 1}),
        );
        assert!(result.success);
        assert_eq!(result.output["result"], true);
    }

    #[test]
    fn case_insensitive_equals() {
        let result = run(
            json!({"left": "Hello", "operator": "equals", "right": "hello", "caseSensitive": false}),
            json!({}),
        );
        assert_eq!(result.output["result"], true);

        let sensitive = run(
            json!({"left": "Hello", "operator": "equals", "right": "hello"}),
            json!({}),
        );
        assert_eq!(sensitive.output["result"], false);
    }

    #[test]
    fn regex_operator() {
        let result = run(
            json!({"left": "{{email}}", "operator": "regex", "right": "^[^@]+@[^@]+$"}),
            json!({"email": "a@x.com"}),
        );
        assert_eq!(result.output["result"], true);

        let bad_pattern = run(
            json!({"left": "x", "operator": "regex", "right": "("}),
            json!({}),
        );
        assert!(!bad_pattern.success);
    }

    #[test]
    fn numeric_comparison_and_is_empty() {
        let gt = run(
            json!({"left": "{{n}}", "operator": "greaterThan", "right": 10}),
            json!({"n": 15}),
        );
        assert_eq!(gt.output["result"], true);

        let empty = run(
            json!({"left": "{{missing}}", "operator": "isEmpty"}),
            json!({}),
        );
        assert_eq!(empty.output["result"], true);
    }
}
