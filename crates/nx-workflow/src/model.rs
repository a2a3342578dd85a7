//! Workflow Model
//!
//! The directed workflow graph and its run/result records. Runs and node
//! results reference workflows and each other by id only; nothing holds a
//! back-pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a node is driven by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Loop,
    SubWorkflow,
}

/// Retry settings for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub use_exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 1_000,
            use_exponential_backoff: true,
        }
    }
}

/// What to do when a node fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErrorStrategy {
    #[default]
    Stop,
    Retry,
    Skip,
    Fallback,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    /// Adapter config executed when strategy is Fallback
    pub fallback_action: Option<serde_json::Value>,
}

/// Loop node iteration shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopType {
    ForEach,
    For,
    While,
    DoWhile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub loop_type: LoopType,
    /// ForEach: `{{path}}` to the items array
    #[serde(default)]
    pub items: Option<String>,
    /// For: iteration count
    #[serde(default)]
    pub count: Option<u32>,
    /// While / DoWhile: continue condition
    #[serde(default)]
    pub condition: Option<String>,
    /// Break out early when this holds
    #[serde(default)]
    pub break_condition: Option<String>,
    /// Overrides the engine-wide iteration ceiling (never exceeds it)
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowConfig {
    pub workflow_id: String,
    /// Child input field -> `{{path}}` template over the parent context
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
}

fn default_true() -> bool {
    true
}

/// Canvas position, carried through round-trips untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    /// Connector id in the registry
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
    #[serde(default)]
    pub condition_config: Option<ConditionConfig>,
    #[serde(default)]
    pub sub_workflow_config: Option<SubWorkflowConfig>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

/// Branch label for edges out of a conditional node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchLabel {
    True,
    False,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    /// Optional condition gating this edge
    #[serde(default)]
    pub condition: Option<String>,
    /// Branch this edge belongs to when leaving a conditional node
    #[serde(default)]
    pub branch: Option<BranchLabel>,
    /// Declared back-edge closing a loop body; excluded from the top-level
    /// acyclicity check
    #[serde(default)]
    pub is_loop_back: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub version: u32,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    /// Ids of the trigger nodes
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub globals: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, excluding declared loop-back edges.
    pub fn successors(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges
            .iter()
            .filter(|e| e.from == id && !e.is_loop_back)
            .collect()
    }

    /// Incoming edges of a node, excluding declared loop-back edges.
    pub fn predecessors(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges
            .iter()
            .filter(|e| e.to == id && !e.is_loop_back)
            .collect()
    }
}

/// Run lifecycle. Pending -> Running -> terminal; terminal states are
/// immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunMode {
    #[default]
    Manual,
    Triggered,
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
}

/// One attempt of one node in one run; `(run_id, node_id, attempt)` is
/// unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub run_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub triggered_by: String,
    #[serde(default)]
    pub node_results: Vec<NodeExecutionResult>,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: &str,
        tenant_id: &str,
        input: serde_json::Value,
        triggered_by: &str,
        mode: RunMode,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: RunStatus::Pending,
            mode,
            input,
            output: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            triggered_by: triggered_by.to_string(),
            node_results: Vec::new(),
        }
    }

    /// Nodes that reached a given status, in result order.
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&str> {
        self.node_results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.node_id.as_str())
            .collect()
    }
}
