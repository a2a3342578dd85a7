//! `{{path}}` Token Substitution
//!
//! The substitution scheme shared by the template renderer, the database and
//! HTTP adapters, and Slack message bodies. Tokens are dotted paths resolved
//! against a JSON object; a missing path renders as the empty string and is
//! reported as a warning rather than a failure.

use serde_json::Value;

use crate::expr::lookup_path;

/// Result of rendering a template string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub text: String,
    /// One entry per unresolved token, in order of appearance.
    pub warnings: Vec<String>,
}

/// Substitute every `{{path}}` token in `text` from `ctx`.
pub fn substitute(text: &str, ctx: &Value) -> Rendered {
    let mut out = String::with_capacity(text.len());
    let mut warnings = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                match lookup_path(ctx, path) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => {
                        warnings.push(format!("unresolved template variable '{}'", path));
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated token: emit literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    Rendered { text: out, warnings }
}

/// Substitute tokens and return a typed value: a template that is exactly one
/// token yields the referenced value unchanged, preserving numbers, booleans
/// and objects for adapter inputs.
pub fn substitute_value(text: &str, ctx: &Value) -> (Value, Vec<String>) {
    let trimmed = text.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return match lookup_path(ctx, path) {
            Some(value) => (value.clone(), Vec::new()),
            None => (
                Value::Null,
                vec![format!("unresolved template variable '{}'", path)],
            ),
        };
    }
    let rendered = substitute(text, ctx);
    (Value::String(rendered.text), rendered.warnings)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
