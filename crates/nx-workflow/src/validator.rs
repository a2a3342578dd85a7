//! Workflow Validator
//!
//! Static checks before save/activation, in order:
//! - V1: exactly one trigger node
//! - V2: every node type is a registered connector
//! - V3: node config validates against the connector's input schema
//! - V4: every edge endpoint resolves to a node
//! - V5: top-level graph is acyclic (declared loop-back edges excluded,
//!   and only valid when they close on a loop node)
//! - V6: every credential reference resolves for the tenant
//!
//! Diagnostics come back ordered; an empty list means the workflow is
//! accepted.

use std::collections::{HashMap, HashSet, VecDeque};

use nx_registry::ConnectorRegistry;
use serde::{Deserialize, Serialize};

use crate::credential::CredentialStore;
use crate::model::{ExecutionMode, Workflow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckCode {
    TriggerPresence,
    UnknownConnector,
    ConfigSchema,
    DanglingEdge,
    Cycle,
    UnknownCredential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: CheckCode,
    pub message: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

pub struct WorkflowValidator<'a> {
    registry: &'a ConnectorRegistry,
    credentials: &'a CredentialStore,
}

impl<'a> WorkflowValidator<'a> {
    pub fn new(registry: &'a ConnectorRegistry, credentials: &'a CredentialStore) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    pub fn validate(&self, workflow: &Workflow) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        self.check_triggers(workflow, &mut diagnostics);
        self.check_connectors(workflow, &mut diagnostics);
        self.check_configs(workflow, &mut diagnostics);
        self.check_edges(workflow, &mut diagnostics);
        self.check_acyclic(workflow, &mut diagnostics);
        self.check_credentials(workflow, &mut diagnostics);

        diagnostics
    }

    fn check_triggers(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        let trigger_ids: Vec<&str> = workflow
            .triggers
            .iter()
            .map(String::as_str)
            .filter(|id| workflow.node(id).is_some())
            .collect();

        match trigger_ids.len() {
            0 => diagnostics.push(Diagnostic {
                code: CheckCode::TriggerPresence,
                message: "workflow has no trigger node".into(),
                node_id: None,
            }),
            1 => {}
            n => diagnostics.push(Diagnostic {
                code: CheckCode::TriggerPresence,
                message: format!("workflow has {} trigger nodes, expected exactly one", n),
                node_id: None,
            }),
        }
    }

    fn check_connectors(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        for node in &workflow.nodes {
            if !self.registry.contains(&node.node_type) {
                diagnostics.push(Diagnostic {
                    code: CheckCode::UnknownConnector,
                    message: format!(
                        "node '{}' uses unregistered connector '{}'",
                        node.id, node.node_type
                    ),
                    node_id: Some(node.id.clone()),
                });
            }
        }
    }

    fn check_configs(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        for node in &workflow.nodes {
            let Some(manifest) = self.registry.latest_matching(&node.node_type, None) else {
                continue; // already reported as UnknownConnector
            };
            for message in manifest.validate_config(&node.config) {
                diagnostics.push(Diagnostic {
                    code: CheckCode::ConfigSchema,
                    message: format!("node '{}': {}", node.id, message),
                    node_id: Some(node.id.clone()),
                });
            }
        }
    }

    fn check_edges(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        let node_ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &workflow.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !node_ids.contains(endpoint.as_str()) {
                    diagnostics.push(Diagnostic {
                        code: CheckCode::DanglingEdge,
                        message: format!(
                            "edge {} -> {} references unknown node '{}'",
                            edge.from, edge.to, endpoint
                        ),
                        node_id: None,
                    });
                }
            }
        }
    }

    /// Kahn's algorithm over the top-level graph. Declared loop-back edges
    /// are excluded, but must close on a loop node to be declared at all.
    fn check_acyclic(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        for edge in workflow.edges.iter().filter(|e| e.is_loop_back) {
            let targets_loop_node = workflow
                .node(&edge.to)
                .map(|n| n.execution_mode == ExecutionMode::Loop)
                .unwrap_or(false);
            if !targets_loop_node {
                diagnostics.push(Diagnostic {
                    code: CheckCode::Cycle,
                    message: format!(
                        "loop-back edge {} -> {} does not close on a loop node",
                        edge.from, edge.to
                    ),
                    node_id: None,
                });
            }
        }

        let node_ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> =
            node_ids.iter().map(|id| (*id, 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in workflow.edges.iter().filter(|e| !e.is_loop_back) {
            if node_ids.contains(edge.from.as_str()) && node_ids.contains(edge.to.as_str()) {
                adjacency
                    .entry(edge.from.as_str())
                    .or_default()
                    .push(edge.to.as_str());
                *in_degree.entry(edge.to.as_str()).or_default() += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in adjacency.get(id).into_iter().flatten() {
                let degree = in_degree.get_mut(next).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != node_ids.len() {
            diagnostics.push(Diagnostic {
                code: CheckCode::Cycle,
                message: "workflow graph contains an undeclared cycle".into(),
                node_id: None,
            });
        }
    }

    fn check_credentials(&self, workflow: &Workflow, diagnostics: &mut Vec<Diagnostic>) {
        for node in &workflow.nodes {
            if let Some(ref credential_id) = node.credential_id {
                if !self.credentials.contains(&workflow.tenant_id, credential_id) {
                    diagnostics.push(Diagnostic {
                        code: CheckCode::UnknownCredential,
                        message: format!(
                            "node '{}' references unknown credential '{}'",
                            node.id, credential_id
                        ),
                        node_id: Some(node.id.clone()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Position, RetryConfig, WorkflowEdge, WorkflowNode};
    use chrono::Utc;
    use nx_registry::{
        AuthSpec, Compatibility, ConflictRules, ConnectorDependencies, ConnectorManifest,
        ConnectorType, InputSpec, PortType,
    };
    use std::collections::HashMap;

    fn registry() -> ConnectorRegistry {
        let registry = ConnectorRegistry::new();
        for (id, connector_type) in [
            ("trigger.manual", ConnectorType::Trigger),
            ("http.request", ConnectorType::Action),
        ] {
            registry
                .insert(ConnectorManifest {
                    id: id.into(),
                    version: semver::Version::new(1, 0, 0),
                    connector_type,
                    category: "test".into(),
                    inputs: if id == "http.request" {
                        vec![InputSpec {
                            name: "url".into(),
                            required: true,
                            port_type: PortType::String,
                        }]
                    } else {
                        vec![]
                    },
                    outputs: vec![],
                    auth: AuthSpec::default(),
                    dependencies: ConnectorDependencies::default(),
                    conflict_rules: ConflictRules::default(),
                    compatibility: Compatibility::default(),
                })
                .unwrap();
        }
        registry
    }

    fn node(id: &str, node_type: &str, config: serde_json::Value) -> WorkflowNode {
        WorkflowNode {
            id: id.into(),
            node_type: node_type.into(),
            label: id.into(),
            position: Position::default(),
            config,
            credential_id: None,
            retry_config: RetryConfig::default(),
            timeout_ms: None,
            is_enabled: true,
            execution_mode: Default::default(),
            loop_config: None,
            condition_config: None,
            sub_workflow_config: None,
            error_handling: Default::default(),
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: from.into(),
            to: to.into(),
            condition: None,
            branch: None,
            is_loop_back: false,
        }
    }

    fn workflow(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>, triggers: Vec<&str>) -> Workflow {
        Workflow {
            id: "w1".into(),
            tenant_id: "t1".into(),
            name: "test".into(),
            version: 1,
            nodes,
            edges,
            triggers: triggers.into_iter().map(String::from).collect(),
            globals: HashMap::new(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn credentials() -> CredentialStore {
        CredentialStore::new(&CredentialStore::generate_key()).unwrap()
    }

    #[test]
    fn valid_workflow_passes() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![
                node("start", "trigger.manual", serde_json::json!({})),
                node("fetch", "http.request", serde_json::json!({"url": "https://x"})),
            ],
            vec![edge("start", "fetch")],
            vec!["start"],
        );
        assert!(validator.validate(&wf).is_empty());
    }

    #[test]
    fn missing_trigger_is_v1() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![node("fetch", "http.request", serde_json::json!({"url": "https://x"}))],
            vec![],
            vec![],
        );
        let diagnostics = validator.validate(&wf);
        assert_eq!(diagnostics[0].code, CheckCode::TriggerPresence);
    }

    #[test]
    fn two_triggers_rejected() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![
                node("a", "trigger.manual", serde_json::json!({})),
                node("b", "trigger.manual", serde_json::json!({})),
            ],
            vec![],
            vec!["a", "b"],
        );
        let diagnostics = validator.validate(&wf);
        assert!(diagnostics.iter().any(|d| d.code == CheckCode::TriggerPresence));
    }

    #[test]
    fn unknown_connector_is_v2() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![
                node("start", "trigger.manual", serde_json::json!({})),
                node("x", "ghost.connector", serde_json::json!({})),
            ],
            vec![edge("start", "x")],
            vec!["start"],
        );
        assert!(validator
            .validate(&wf)
            .iter()
            .any(|d| d.code == CheckCode::UnknownConnector));
    }

    #[test]
    fn bad_config_is_v3() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![
                node("start", "trigger.manual", serde_json::json!({})),
                node("fetch", "http.request", serde_json::json!({})), // url missing
            ],
            vec![edge("start", "fetch")],
            vec!["start"],
        );
        assert!(validator
            .validate(&wf)
            .iter()
            .any(|d| d.code == CheckCode::ConfigSchema));
    }

    #[test]
    fn dangling_edge_is_v4() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![node("start", "trigger.manual", serde_json::json!({}))],
            vec![edge("start", "nowhere")],
            vec!["start"],
        );
        assert!(validator
            .validate(&wf)
            .iter()
            .any(|d| d.code == CheckCode::DanglingEdge));
    }

    #[test]
    fn cycle_is_v5_unless_declared_loop_back() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let wf = workflow(
            vec![
                node("start", "trigger.manual", serde_json::json!({})),
                node("a", "http.request", serde_json::json!({"url": "https://x"})),
                node("b", "http.request", serde_json::json!({"url": "https://x"})),
            ],
            vec![edge("start", "a"), edge("a", "b"), edge("b", "a")],
            vec!["start"],
        );
        assert!(validator.validate(&wf).iter().any(|d| d.code == CheckCode::Cycle));

        // same shape with the back-edge declared and closing on a loop node
        let mut loop_node = node("a", "http.request", serde_json::json!({"url": "https://x"}));
        loop_node.execution_mode = ExecutionMode::Loop;
        loop_node.loop_config = Some(crate::model::LoopConfig {
            loop_type: crate::model::LoopType::For,
            items: None,
            count: Some(2),
            condition: None,
            break_condition: None,
            max_iterations: None,
        });
        let mut back = edge("b", "a");
        back.is_loop_back = true;
        let wf = workflow(
            vec![
                node("start", "trigger.manual", serde_json::json!({})),
                loop_node,
                node("b", "http.request", serde_json::json!({"url": "https://x"})),
            ],
            vec![edge("start", "a"), edge("a", "b"), back],
            vec!["start"],
        );
        assert!(validator.validate(&wf).is_empty());
    }

    #[test]
    fn unknown_credential_is_v6() {
        let registry = registry();
        let credentials = credentials();
        let validator = WorkflowValidator::new(&registry, &credentials);

        let mut with_credential =
            node("fetch", "http.request", serde_json::json!({"url": "https://x"}));
        with_credential.credential_id = Some("missing".into());

        let wf = workflow(
            vec![node("start", "trigger.manual", serde_json::json!({})), with_credential],
            vec![edge("start", "fetch")],
            vec!["start"],
        );
        assert!(validator
            .validate(&wf)
            .iter()
            .any(|d| d.code == CheckCode::UnknownCredential));
    }
}
