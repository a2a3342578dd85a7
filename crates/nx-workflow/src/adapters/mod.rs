//! Built-in Connector Adapters
//!
//! One module per connector. All adapters share the `{{path}}` substitution
//! scheme over the node's structured inputs.

use serde_json::Value;

use nx_common::substitution::{substitute, substitute_value};

pub mod database;
pub mod http;
pub mod if_condition;
pub mod notify_send;
pub mod set_data;
pub mod slack;
pub mod trigger;

pub use database::{DatabaseQueryAdapter, NullQueryExecutor, QueryExecutor};
pub use http::HttpRequestAdapter;
pub use if_condition::IfConditionAdapter;
pub use notify_send::NotifySendAdapter;
pub use set_data::SetDataAdapter;
pub use slack::SlackAdapter;
pub use trigger::{DeliveryStatusTriggerAdapter, ManualTriggerAdapter};

/// A config string with tokens substituted from the input context.
pub(crate) fn config_str(config: &Value, key: &str, ctx: &Value) -> Option<String> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| substitute(s, ctx).text)
}

/// A config value: strings get token substitution (a single-token string
/// keeps the referenced value's type), other values pass through.
pub(crate) fn config_value(config: &Value, key: &str, ctx: &Value) -> Option<Value> {
    match config.get(key)? {
        Value::String(s) => Some(substitute_value(s, ctx).0),
        other => Some(other.clone()),
    }
}
