//! Connector Manifests
//!
//! The immutable description of one connector version: typed ports, auth
//! requirements, dependency declarations, and conflict rules. Manifests are
//! what the resolver solves over and what the workflow validator checks
//! node configs against.

use semver::Version;
use serde::{Deserialize, Serialize};

/// Connector role inside a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorType {
    Trigger,
    Action,
    Transform,
}

/// Declared value type for an input/output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl PortType {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            PortType::String => value.is_string(),
            PortType::Number => value.is_number(),
            PortType::Boolean => value.is_boolean(),
            PortType::Object => value.is_object(),
            PortType::Array => value.is_array(),
            PortType::Any => true,
        }
    }
}

/// One declared input of a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "PortType::any")]
    pub port_type: PortType,
}

impl PortType {
    fn any() -> PortType {
        PortType::Any
    }
}

/// One declared output of a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    pub name: String,
    #[serde(default = "PortType::any")]
    pub port_type: PortType,
}

/// Authentication the connector needs at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    /// "none", "apiKey", "oauth2", ...
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A versioned dependency on another connector or peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    pub id: String,
    /// Semver range, e.g. `>=1.0.0, <2.0.0`
    pub range: String,
}

/// Declared dependencies of one connector version. Peers and direct
/// connector dependencies are both hard constraints for the resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorDependencies {
    #[serde(default)]
    pub peers: Vec<DependencySpec>,
    #[serde(default)]
    pub connectors: Vec<DependencySpec>,
    #[serde(default)]
    pub apis: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Conflict declarations, pattern `id@range`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRules {
    #[serde(default)]
    pub incompatible_with: Vec<String>,
}

/// Platform compatibility window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compatibility {
    #[serde(default)]
    pub min_platform_version: Option<String>,
    #[serde(default)]
    pub max_platform_version: Option<String>,
}

/// One immutable connector version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorManifest {
    pub id: String,
    pub version: Version,
    pub connector_type: ConnectorType,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub dependencies: ConnectorDependencies,
    #[serde(default)]
    pub conflict_rules: ConflictRules,
    #[serde(default)]
    pub compatibility: Compatibility,
}

impl ConnectorManifest {
    /// Validate a node config object against the declared inputs: required
    /// inputs present, present inputs type-correct. Returns diagnostics.
    pub fn validate_config(&self, config: &serde_json::Value) -> Vec<String> {
        let mut diagnostics = Vec::new();
        let object = match config {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null if self.inputs.iter().all(|i| !i.required) => {
                return diagnostics
            }
            _ => {
                diagnostics.push(format!("config for '{}' must be an object", self.id));
                return diagnostics;
            }
        };

        for input in &self.inputs {
            match object.get(&input.name) {
                None if input.required => {
                    diagnostics.push(format!(
                        "required input '{}' missing for connector '{}'",
                        input.name, self.id
                    ));
                }
                Some(value) if !input.port_type.matches(value) => {
                    // template tokens resolve at execution time, so a string
                    // placeholder is accepted for any declared type
                    if !(value.is_string()
                        && value.as_str().map(|s| s.contains("{{")).unwrap_or(false))
                    {
                        diagnostics.push(format!(
                            "input '{}' of connector '{}' has wrong type (expected {:?})",
                            input.name, self.id, input.port_type
                        ));
                    }
                }
                _ => {}
            }
        }
        diagnostics
    }
}

/// Parse a conflict pattern `id@range` into its parts.
pub fn parse_conflict_pattern(pattern: &str) -> Option<(&str, semver::VersionReq)> {
    let (id, range) = pattern.split_once('@')?;
    let req = semver::VersionReq::parse(range.trim()).ok()?;
    Some((id.trim(), req))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_with_inputs(inputs: Vec<InputSpec>) -> ConnectorManifest {
        ConnectorManifest {
            id: "http.request".into(),
            version: Version::new(1, 0, 0),
            connector_type: ConnectorType::Action,
            category: "http".into(),
            inputs,
            outputs: vec![],
            auth: AuthSpec::default(),
            dependencies: ConnectorDependencies::default(),
            conflict_rules: ConflictRules::default(),
            compatibility: Compatibility::default(),
        }
    }

    #[test]
    fn required_input_missing_is_diagnosed() {
        let manifest = manifest_with_inputs(vec![InputSpec {
            name: "url".into(),
            required: true,
            port_type: PortType::String,
        }]);
        let diagnostics = manifest.validate_config(&json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("url"));
    }

    #[test]
    fn wrong_type_is_diagnosed_but_templates_pass() {
        let manifest = manifest_with_inputs(vec![InputSpec {
            name: "count".into(),
            required: true,
            port_type: PortType::Number,
        }]);
        assert_eq!(manifest.validate_config(&json!({"count": "five"})).len(), 1);
        assert!(manifest.validate_config(&json!({"count": 5})).is_empty());
        // a template token is resolved later and accepted now
        assert!(manifest.validate_config(&json!({"count": "{{items.length}}"})).is_empty());
    }

    #[test]
    fn conflict_pattern_parsing() {
        let (id, req) = parse_conflict_pattern("legacy.db@<2.0.0").unwrap();
        assert_eq!(id, "legacy.db");
        assert!(req.matches(&Version::new(1, 9, 0)));
        assert!(!req.matches(&Version::new(2, 0, 0)));

        assert!(parse_conflict_pattern("no-at-sign").is_none());
    }
}
