//! Workflow Engine
//!
//! Topological execution of a workflow graph with per-node retries,
//! conditional branches, loop nodes, sub-workflows, timeouts, and
//! cooperative cancellation. One driver task owns a run at a time (a
//! per-run lock serialises mutation); separate runs execute in parallel.
//! Every lifecycle step publishes to the run event bus.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use nx_common::expr::Expr;
use nx_common::substitution::substitute_value;
use nx_common::Shutdown;
use nx_config::EngineOptions;

use crate::adapter::{AdapterContext, AdapterRegistry, ExecutionResult, RunMetadata};
use crate::credential::CredentialStore;
use crate::events::{RunEventBus, RunEventKind};
use crate::model::{
    BranchLabel, ErrorStrategy, ExecutionMode, LoopConfig, LoopType, NodeExecutionResult,
    NodeStatus, RunMode, RunStatus, Workflow, WorkflowNode, WorkflowRun,
};
use crate::repository::{RunRepository, WorkflowRepository};
use crate::{Result, WorkflowError};

pub struct WorkflowEngine {
    workflows: Arc<dyn WorkflowRepository>,
    runs: Arc<dyn RunRepository>,
    adapters: Arc<AdapterRegistry>,
    credentials: Arc<CredentialStore>,
    bus: Arc<RunEventBus>,
    options: EngineOptions,
    cancel_flags: DashMap<String, Arc<Shutdown>>,
    run_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    // for handing owned handles to spawned driver tasks
    self_ref: std::sync::Weak<WorkflowEngine>,
}

/// Outcome of one node after retries and error handling.
enum NodeOutcome {
    Success(Value),
    Skipped,
    /// Failure absorbed by Continue: successors run without this output
    ContinuedFailure,
    /// Unhandled failure: the run fails
    FatalFailure,
    Cancelled,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        runs: Arc<dyn RunRepository>,
        adapters: Arc<AdapterRegistry>,
        credentials: Arc<CredentialStore>,
        bus: Arc<RunEventBus>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            workflows,
            runs,
            adapters,
            credentials,
            bus,
            options,
            cancel_flags: DashMap::new(),
            run_locks: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine dropped while in use")
    }

    pub fn bus(&self) -> &Arc<RunEventBus> {
        &self.bus
    }

    pub fn runs(&self) -> &Arc<dyn RunRepository> {
        &self.runs
    }

    pub fn workflows(&self) -> &Arc<dyn WorkflowRepository> {
        &self.workflows
    }

    /// Create a run and execute it in a background driver task. Returns the
    /// run in Pending state.
    pub async fn start_run(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        input: Value,
        triggered_by: &str,
        mode: RunMode,
    ) -> Result<WorkflowRun> {
        let run = self
            .create_run(tenant_id, workflow_id, input, triggered_by, mode)
            .await?;

        let engine = self.handle();
        let run_id = run.id.clone();
        let tenant = tenant_id.to_string();
        tokio::spawn(async move {
            engine.drive(&tenant, &run_id, 0).await;
        });

        Ok(run)
    }

    /// Create a run and execute it to completion before returning. Used by
    /// blocking sub-workflow nodes and by callers that need the result.
    pub async fn execute_run(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        input: Value,
        triggered_by: &str,
        mode: RunMode,
    ) -> Result<WorkflowRun> {
        let run = self
            .create_run(tenant_id, workflow_id, input, triggered_by, mode)
            .await?;
        self.drive(tenant_id, &run.id, 0).await;
        self.runs
            .get(tenant_id, &run.id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(run.id))
    }

    async fn create_run(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        input: Value,
        triggered_by: &str,
        mode: RunMode,
    ) -> Result<WorkflowRun> {
        let workflow = self
            .workflows
            .get(tenant_id, workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        if !workflow.is_active {
            return Err(WorkflowError::Validation(format!(
                "workflow '{}' is not active",
                workflow_id
            )));
        }

        let run = WorkflowRun::new(workflow_id, tenant_id, input, triggered_by, mode);
        self.runs.insert(run.clone()).await?;
        self.bus.publish(
            RunEventKind::RunCreated,
            tenant_id,
            workflow_id,
            &run.id,
            None,
            json!({ "mode": mode, "triggeredBy": triggered_by }),
        );
        info!(
            tenant_id = %tenant_id,
            workflow_id = %workflow_id,
            run_id = %run.id,
            mode = ?mode,
            "Workflow run created"
        );
        Ok(run)
    }

    /// Replay an existing run: a fresh run of the same workflow, from the
    /// beginning, with an optional override input.
    pub async fn replay(
        &self,
        tenant_id: &str,
        run_id: &str,
        override_input: Option<Value>,
    ) -> Result<WorkflowRun> {
        let original = self
            .runs
            .get(tenant_id, run_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(run_id.to_string()))?;

        let input = override_input.unwrap_or_else(|| original.input.clone());
        self.start_run(
            tenant_id,
            &original.workflow_id,
            input,
            &format!("replay:{}", run_id),
            RunMode::Replay,
        )
        .await
    }

    /// Request cooperative cancellation of a run.
    pub fn cancel_run(&self, run_id: &str) {
        if let Some(flag) = self.cancel_flags.get(run_id) {
            info!(run_id = %run_id, "Run cancellation requested");
            flag.trigger();
        }
    }

    /// The driver: owns the run from Running to a terminal state.
    ///
    /// Returns a boxed future (rather than being an `async fn`) so that the
    /// recursive call chain `drive -> execute_graph -> run_sub_workflow ->
    /// drive` has an explicit `Send` future type to bottom out on, instead of
    /// asking the compiler to infer `Send` for a self-referential opaque
    /// future type.
    fn drive<'a>(
        &'a self,
        tenant_id: &'a str,
        run_id: &'a str,
        depth: u32,
    ) -> futures::future::BoxFuture<'a, ()> {
        Box::pin(self.drive_inner(tenant_id, run_id, depth))
    }

    async fn drive_inner(&self, tenant_id: &str, run_id: &str, depth: u32) {
        // one logical lock per run id
        let lock = self
            .run_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Ok(Some(mut run)) = self.runs.get(tenant_id, run_id).await else {
            error!(run_id = %run_id, "Run vanished before execution");
            return;
        };
        if run.status != RunStatus::Pending {
            return;
        }
        let Ok(Some(workflow)) = self.workflows.get(tenant_id, &run.workflow_id).await else {
            error!(run_id = %run_id, workflow_id = %run.workflow_id, "Workflow vanished");
            return;
        };

        let cancel = self
            .cancel_flags
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Shutdown::new()))
            .clone();

        run.status = RunStatus::Running;
        let _ = self.runs.update(run.clone()).await;
        self.bus.publish(
            RunEventKind::RunStarted,
            tenant_id,
            &workflow.id,
            run_id,
            None,
            Value::Null,
        );

        let deadline = Duration::from_secs(self.options.run_timeout_secs);
        let outcome = tokio::time::timeout(
            deadline,
            self.execute_graph(&mut run, &workflow, &cancel, depth),
        )
        .await;

        let final_status = match outcome {
            Ok(status) => status,
            Err(_) => {
                warn!(run_id = %run_id, timeout_secs = deadline.as_secs(), "Run deadline exceeded");
                RunStatus::Timeout
            }
        };

        run.status = final_status;
        run.end_time = Some(Utc::now());
        run.duration_ms = Some(
            (run.end_time.unwrap() - run.start_time)
                .num_milliseconds()
                .max(0) as u64,
        );
        let _ = self.runs.update(run.clone()).await;

        let terminal_kind = match final_status {
            RunStatus::Completed => RunEventKind::RunCompleted,
            RunStatus::Cancelled => RunEventKind::RunCancelled,
            _ => RunEventKind::RunFailed,
        };
        self.bus.publish(
            terminal_kind,
            tenant_id,
            &workflow.id,
            run_id,
            None,
            json!({ "status": final_status, "durationMs": run.duration_ms }),
        );
        info!(
            tenant_id = %tenant_id,
            run_id = %run_id,
            status = ?final_status,
            duration_ms = ?run.duration_ms,
            "Workflow run finished"
        );

        self.cancel_flags.remove(run_id);
        self.run_locks.remove(run_id);
        self.bus.forget_run(run_id);
    }

    /// Execute the graph: ready-set loop ordered by topological layer then
    /// node id.
    async fn execute_graph(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        cancel: &Arc<Shutdown>,
        depth: u32,
    ) -> RunStatus {
        let layers = topological_layers(workflow);
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut ready: BTreeSet<(usize, String)> = BTreeSet::new();

        for trigger_id in &workflow.triggers {
            if workflow.node(trigger_id).is_some() {
                let layer = layers.get(trigger_id.as_str()).copied().unwrap_or(0);
                ready.insert((layer, trigger_id.clone()));
            }
        }

        while let Some((_layer, node_id)) = ready.pop_first() {
            if cancel.is_triggered() {
                return RunStatus::Cancelled;
            }
            let Some(node) = workflow.node(&node_id) else {
                continue;
            };

            if !node.is_enabled {
                debug!(run_id = %run.id, node_id = %node_id, "Node disabled, skipping");
                run.node_results.push(skipped_result(&run.id, &node_id, Value::Null));
                self.publish_node_finished(run, workflow, &node_id, NodeStatus::Skipped, 0);
                satisfied.insert(node_id.clone());
                self.enqueue_ready_successors(
                    workflow, &node_id, &outputs, &satisfied, &layers, &mut ready, None,
                );
                continue;
            }

            let inputs = build_inputs(run, workflow, node, &outputs);
            let outcome = match node.execution_mode {
                ExecutionMode::Conditional => {
                    self.run_conditional(run, workflow, node, &inputs, cancel).await
                }
                ExecutionMode::Loop => self.run_loop(run, workflow, node, &inputs, cancel).await,
                ExecutionMode::SubWorkflow => {
                    self.run_sub_workflow(run, workflow, node, &inputs, cancel, depth).await
                }
                ExecutionMode::Sequential | ExecutionMode::Parallel => {
                    let (outcome, _) =
                        self.run_plain_node(run, workflow, node, &inputs, cancel).await;
                    outcome
                }
            };

            match outcome {
                NodeOutcome::Success(output) => {
                    outputs.insert(node_id.clone(), output.clone());
                    satisfied.insert(node_id.clone());

                    // conditional nodes pick their branch from the verdict
                    let branch = if node.execution_mode == ExecutionMode::Conditional {
                        let verdict = output
                            .get("result")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        Some(if verdict { BranchLabel::True } else { BranchLabel::False })
                    } else {
                        None
                    };

                    // untaken branch targets become Skipped
                    if let Some(taken) = branch {
                        for edge in workflow.successors(&node_id) {
                            if let Some(label) = edge.branch {
                                if label != taken && !satisfied.contains(&edge.to) {
                                    run.node_results.push(skipped_result(
                                        &run.id,
                                        &edge.to,
                                        Value::Null,
                                    ));
                                    self.publish_node_finished(
                                        run,
                                        workflow,
                                        &edge.to,
                                        NodeStatus::Skipped,
                                        0,
                                    );
                                    satisfied.insert(edge.to.clone());
                                    self.enqueue_ready_successors(
                                        workflow, &edge.to, &outputs, &satisfied, &layers,
                                        &mut ready, None,
                                    );
                                }
                            }
                        }
                    }

                    self.enqueue_ready_successors(
                        workflow, &node_id, &outputs, &satisfied, &layers, &mut ready, branch,
                    );
                }
                NodeOutcome::Skipped => {
                    satisfied.insert(node_id.clone());
                    self.enqueue_ready_successors(
                        workflow, &node_id, &outputs, &satisfied, &layers, &mut ready, None,
                    );
                }
                NodeOutcome::ContinuedFailure => {
                    satisfied.insert(node_id.clone());
                    self.enqueue_ready_successors(
                        workflow, &node_id, &outputs, &satisfied, &layers, &mut ready, None,
                    );
                }
                NodeOutcome::FatalFailure => return RunStatus::Failed,
                NodeOutcome::Cancelled => return RunStatus::Cancelled,
            }

            let _ = self.runs.update(run.clone()).await;
        }

        if cancel.is_triggered() {
            return RunStatus::Cancelled;
        }

        // run output: leaf node outputs keyed by node id
        let leaves: serde_json::Map<String, Value> = outputs
            .iter()
            .filter(|(id, _)| workflow.successors(id).is_empty())
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        run.output = Some(Value::Object(leaves));
        RunStatus::Completed
    }

    /// Enqueue successors of `from` whose predecessors are all satisfied and
    /// whose edge (condition, branch) admits them.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_ready_successors(
        &self,
        workflow: &Workflow,
        from: &str,
        outputs: &HashMap<String, Value>,
        satisfied: &HashSet<String>,
        layers: &HashMap<&str, usize>,
        ready: &mut BTreeSet<(usize, String)>,
        taken_branch: Option<BranchLabel>,
    ) {
        for edge in workflow.successors(from) {
            if let (Some(label), Some(taken)) = (edge.branch, taken_branch) {
                if label != taken {
                    continue;
                }
            }
            if let Some(ref condition) = edge.condition {
                let ctx = edge_condition_context(outputs, from);
                let holds = Expr::parse(condition)
                    .and_then(|e| e.evaluate(&ctx))
                    .unwrap_or(false);
                if !holds {
                    continue;
                }
            }
            if satisfied.contains(&edge.to) {
                continue;
            }
            let all_predecessors_satisfied = workflow
                .predecessors(&edge.to)
                .iter()
                .all(|e| satisfied.contains(&e.from));
            if all_predecessors_satisfied {
                let layer = layers.get(edge.to.as_str()).copied().unwrap_or(0);
                ready.insert((layer, edge.to.clone()));
            }
        }
    }

    /// Execute a plain node with its retry policy. Returns the outcome and
    /// the final adapter result.
    async fn run_plain_node(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        node: &WorkflowNode,
        inputs: &Value,
        cancel: &Arc<Shutdown>,
    ) -> (NodeOutcome, Option<ExecutionResult>) {
        let max_attempts = if node.error_handling.strategy == ErrorStrategy::Retry {
            1 + node.retry_config.max_retries
        } else {
            1
        };

        self.bus.publish(
            RunEventKind::NodeStarted,
            &run.tenant_id,
            &workflow.id,
            &run.id,
            Some(&node.id),
            json!({ "type": node.node_type }),
        );

        let mut last_result: Option<ExecutionResult> = None;
        for attempt in 1..=max_attempts {
            if cancel.is_triggered() {
                return (NodeOutcome::Cancelled, last_result);
            }

            let result = self.invoke_adapter(run, node, inputs.clone(), cancel).await;
            let status = node_status_for(&result);
            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status,
                input: inputs.clone(),
                output: result.success.then(|| result.output.clone()),
                error_message: result.error_message.clone(),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt,
            });

            if result.success {
                self.publish_node_finished(run, workflow, &node.id, NodeStatus::Success, result.duration_ms);
                return (NodeOutcome::Success(result.output.clone()), Some(result));
            }

            warn!(
                run_id = %run.id,
                node_id = %node.id,
                attempt,
                error = ?result.error_message,
                "Node attempt failed"
            );
            let duration_ms = result.duration_ms;
            last_result = Some(result);

            // a failure under a tripped cancel flag is a cancellation, not
            // a node error
            if cancel.is_triggered() {
                self.publish_node_finished(run, workflow, &node.id, status, duration_ms);
                return (NodeOutcome::Cancelled, last_result);
            }

            if attempt < max_attempts {
                let delay = if node.retry_config.use_exponential_backoff {
                    node.retry_config.retry_delay_ms.saturating_mul(1 << (attempt - 1).min(16))
                } else {
                    node.retry_config.retry_delay_ms
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = cancel.wait() => return (NodeOutcome::Cancelled, last_result),
                }
            }
        }

        // terminal failure: apply the error handling strategy
        let final_status = last_result
            .as_ref()
            .map(node_status_for)
            .unwrap_or(NodeStatus::Failed);
        self.publish_node_finished(
            run,
            workflow,
            &node.id,
            final_status,
            last_result.as_ref().map(|r| r.duration_ms).unwrap_or(0),
        );

        match node.error_handling.strategy {
            ErrorStrategy::Stop | ErrorStrategy::Retry => (NodeOutcome::FatalFailure, last_result),
            ErrorStrategy::Skip => {
                // attempt numbers stay unique past the recorded failures
                let mut marker = skipped_result(&run.id, &node.id, inputs.clone());
                marker.attempt = max_attempts + 1;
                run.node_results.push(marker);
                (NodeOutcome::Skipped, last_result)
            }
            ErrorStrategy::Continue => (NodeOutcome::ContinuedFailure, last_result),
            ErrorStrategy::Fallback => {
                let Some(ref fallback) = node.error_handling.fallback_action else {
                    return (NodeOutcome::FatalFailure, last_result);
                };
                let fallback_type = fallback
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let Some(adapter) = self.adapters.get(&fallback_type) else {
                    warn!(node_id = %node.id, fallback = %fallback_type, "Unknown fallback adapter");
                    return (NodeOutcome::FatalFailure, last_result);
                };
                let context = AdapterContext {
                    tenant_id: run.tenant_id.clone(),
                    run_metadata: RunMetadata {
                        run_id: run.id.clone(),
                        node_id: node.id.clone(),
                    },
                    node_config: fallback.get("config").cloned().unwrap_or(Value::Null),
                    inputs: inputs.clone(),
                    credential_secret: None,
                    cancellation: cancel.clone(),
                };
                let result = adapter.execute(context).await;
                if result.success {
                    (NodeOutcome::Success(result.output.clone()), Some(result))
                } else {
                    (NodeOutcome::FatalFailure, Some(result))
                }
            }
        }
    }

    /// Conditional node: an explicit condition expression, or the node's
    /// adapter verdict (`output.result`).
    async fn run_conditional(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        node: &WorkflowNode,
        inputs: &Value,
        cancel: &Arc<Shutdown>,
    ) -> NodeOutcome {
        if let Some(ref condition) = node.condition_config {
            self.bus.publish(
                RunEventKind::NodeStarted,
                &run.tenant_id,
                &workflow.id,
                &run.id,
                Some(&node.id),
                json!({ "type": node.node_type }),
            );
            let verdict = match Expr::parse(&condition.expression)
                .and_then(|e| e.evaluate(inputs))
            {
                Ok(v) => v,
                Err(e) => {
                    run.node_results.push(NodeExecutionResult {
                        run_id: run.id.clone(),
                        node_id: node.id.clone(),
                        status: NodeStatus::Failed,
                        input: inputs.clone(),
                        output: None,
                        error_message: Some(format!("condition: {}", e)),
                        start_time: Utc::now(),
                        end_time: Some(Utc::now()),
                        attempt: 1,
                    });
                    self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, 0);
                    return NodeOutcome::FatalFailure;
                }
            };
            let output = json!({ "result": verdict });
            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status: NodeStatus::Success,
                input: inputs.clone(),
                output: Some(output.clone()),
                error_message: None,
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt: 1,
            });
            self.publish_node_finished(run, workflow, &node.id, NodeStatus::Success, 0);
            return NodeOutcome::Success(output);
        }

        // no expression: delegate to the adapter (logic.if)
        let (outcome, _) = self.run_plain_node(run, workflow, node, inputs, cancel).await;
        outcome
    }

    /// Loop node: the adapter is invoked per iteration; progress events are
    /// published per iteration.
    async fn run_loop(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        node: &WorkflowNode,
        inputs: &Value,
        cancel: &Arc<Shutdown>,
    ) -> NodeOutcome {
        let Some(ref config) = node.loop_config else {
            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status: NodeStatus::Failed,
                input: inputs.clone(),
                output: None,
                error_message: Some("loop node without loopConfig".into()),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt: 1,
            });
            self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, 0);
            return NodeOutcome::FatalFailure;
        };

        self.bus.publish(
            RunEventKind::NodeStarted,
            &run.tenant_id,
            &workflow.id,
            &run.id,
            Some(&node.id),
            json!({ "type": node.node_type, "loopType": config.loop_type }),
        );

        let ceiling = config
            .max_iterations
            .unwrap_or(self.options.max_loop_iterations)
            .min(self.options.max_loop_iterations);

        let items: Option<Vec<Value>> = match config.loop_type {
            LoopType::ForEach => {
                let path = config.items.as_deref().unwrap_or("items");
                let (value, _) = substitute_value(
                    &format!("{{{{{}}}}}", path.trim_matches(['{', '}'])),
                    inputs,
                );
                match value {
                    Value::Array(items) => Some(items),
                    _ => Some(Vec::new()),
                }
            }
            LoopType::For => Some(
                (0..config.count.unwrap_or(0).min(ceiling))
                    .map(|i| json!(i))
                    .collect(),
            ),
            LoopType::While | LoopType::DoWhile => None,
        };

        let mut results = Vec::new();
        let mut last_output = Value::Null;
        let mut index: u32 = 0;

        loop {
            if index >= ceiling {
                break;
            }
            if cancel.is_triggered() {
                return NodeOutcome::Cancelled;
            }

            // bounded loops end with their items; condition loops check the
            // continue condition (While before, DoWhile after the first pass)
            let item = match &items {
                Some(list) => {
                    if index as usize >= list.len() {
                        break;
                    }
                    list[index as usize].clone()
                }
                None => Value::Null,
            };
            if items.is_none() && config.loop_type == LoopType::While {
                if !self.loop_condition_holds(config, inputs, &last_output, index) {
                    break;
                }
            }

            let iteration_inputs = loop_iteration_context(inputs, &item, index, &last_output);
            let result = self
                .invoke_adapter(run, node, iteration_inputs.clone(), cancel)
                .await;

            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status: node_status_for(&result),
                input: iteration_inputs,
                output: result.success.then(|| result.output.clone()),
                error_message: result.error_message.clone(),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt: index + 1,
            });
            self.bus.publish(
                RunEventKind::NodeProgress,
                &run.tenant_id,
                &workflow.id,
                &run.id,
                Some(&node.id),
                json!({ "iteration": index, "success": result.success }),
            );

            if !result.success {
                self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, result.duration_ms);
                return match node.error_handling.strategy {
                    ErrorStrategy::Skip => NodeOutcome::Skipped,
                    ErrorStrategy::Continue => NodeOutcome::ContinuedFailure,
                    _ => NodeOutcome::FatalFailure,
                };
            }

            last_output = result.output.clone();
            results.push(result.output);
            index += 1;

            if let Some(ref break_condition) = config.break_condition {
                let ctx = loop_iteration_context(inputs, &item, index, &last_output);
                let holds = Expr::parse(break_condition)
                    .and_then(|e| e.evaluate(&ctx))
                    .unwrap_or(false);
                if holds {
                    debug!(run_id = %run.id, node_id = %node.id, iteration = index, "Loop break condition met");
                    break;
                }
            }
            if items.is_none() && config.loop_type == LoopType::DoWhile {
                if !self.loop_condition_holds(config, inputs, &last_output, index) {
                    break;
                }
            }
        }

        let output = json!({
            "iterations": index,
            "results": results,
            "lastOutput": last_output,
        });
        self.publish_node_finished(run, workflow, &node.id, NodeStatus::Success, 0);
        NodeOutcome::Success(output)
    }

    fn loop_condition_holds(
        &self,
        config: &LoopConfig,
        inputs: &Value,
        last_output: &Value,
        index: u32,
    ) -> bool {
        let Some(ref condition) = config.condition else {
            return false;
        };
        let ctx = loop_iteration_context(inputs, &Value::Null, index, last_output);
        Expr::parse(condition)
            .and_then(|e| e.evaluate(&ctx))
            .unwrap_or(false)
    }

    /// Sub-workflow node: start a nested run; optionally block on it and
    /// merge its output namespaced under this node.
    async fn run_sub_workflow(
        &self,
        run: &mut WorkflowRun,
        workflow: &Workflow,
        node: &WorkflowNode,
        inputs: &Value,
        cancel: &Arc<Shutdown>,
        depth: u32,
    ) -> NodeOutcome {
        let Some(ref config) = node.sub_workflow_config else {
            self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, 0);
            return NodeOutcome::FatalFailure;
        };
        if depth >= self.options.max_sub_workflow_depth {
            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status: NodeStatus::Failed,
                input: inputs.clone(),
                output: None,
                error_message: Some(format!(
                    "sub-workflow nesting exceeds depth {}",
                    self.options.max_sub_workflow_depth
                )),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt: 1,
            });
            self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, 0);
            return NodeOutcome::FatalFailure;
        }

        self.bus.publish(
            RunEventKind::NodeStarted,
            &run.tenant_id,
            &workflow.id,
            &run.id,
            Some(&node.id),
            json!({ "type": node.node_type, "subWorkflowId": config.workflow_id }),
        );

        // map child inputs from the parent context
        let mut child_input = serde_json::Map::new();
        for (field, template) in &config.input_mapping {
            let (value, _) = substitute_value(template, inputs);
            child_input.insert(field.clone(), value);
        }
        let child_input = Value::Object(child_input);

        let child = match self
            .create_run(
                &run.tenant_id,
                &config.workflow_id,
                child_input,
                &format!("sub-workflow:{}:{}", run.id, node.id),
                RunMode::Triggered,
            )
            .await
        {
            Ok(child) => child,
            Err(e) => {
                run.node_results.push(NodeExecutionResult {
                    run_id: run.id.clone(),
                    node_id: node.id.clone(),
                    status: NodeStatus::Failed,
                    input: inputs.clone(),
                    output: None,
                    error_message: Some(format!("sub-workflow: {}", e)),
                    start_time: Utc::now(),
                    end_time: Some(Utc::now()),
                    attempt: 1,
                });
                self.publish_node_finished(run, workflow, &node.id, NodeStatus::Failed, 0);
                return NodeOutcome::FatalFailure;
            }
        };

        if !config.wait_for_completion {
            let engine = self.handle();
            let tenant = run.tenant_id.clone();
            let child_id = child.id.clone();
            let child_depth = depth + 1;
            tokio::spawn(async move {
                engine.drive(&tenant, &child_id, child_depth).await;
            });
            let output = json!({ "runId": child.id, "status": RunStatus::Pending });
            run.node_results.push(NodeExecutionResult {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
                status: NodeStatus::Success,
                input: inputs.clone(),
                output: Some(output.clone()),
                error_message: None,
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                attempt: 1,
            });
            self.publish_node_finished(run, workflow, &node.id, NodeStatus::Success, 0);
            return NodeOutcome::Success(output);
        }

        // blocking: drive the child inline (recursion is depth-limited)
        let tenant = run.tenant_id.clone();
        self.drive(&tenant, &child.id, depth + 1).await;
        if cancel.is_triggered() {
            return NodeOutcome::Cancelled;
        }

        let finished = self.runs.get(&tenant, &child.id).await.ok().flatten();
        let (child_status, child_output) = finished
            .map(|c| (c.status, c.output.unwrap_or(Value::Null)))
            .unwrap_or((RunStatus::Failed, Value::Null));

        // outputs merge namespaced under the node id, never over globals
        let output = json!({
            "runId": child.id,
            "status": child_status,
            "output": child_output,
        });
        let success = child_status == RunStatus::Completed;
        run.node_results.push(NodeExecutionResult {
            run_id: run.id.clone(),
            node_id: node.id.clone(),
            status: if success { NodeStatus::Success } else { NodeStatus::Failed },
            input: inputs.clone(),
            output: Some(output.clone()),
            error_message: (!success).then(|| format!("sub-workflow run {:?}", child_status)),
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            attempt: 1,
        });
        self.publish_node_finished(
            run,
            workflow,
            &node.id,
            if success { NodeStatus::Success } else { NodeStatus::Failed },
            0,
        );

        if success {
            NodeOutcome::Success(output)
        } else {
            match node.error_handling.strategy {
                ErrorStrategy::Skip => NodeOutcome::Skipped,
                ErrorStrategy::Continue => NodeOutcome::ContinuedFailure,
                _ => NodeOutcome::FatalFailure,
            }
        }
    }

    /// One adapter invocation with per-node timeout and the credential
    /// decrypted only for its duration.
    async fn invoke_adapter(
        &self,
        run: &WorkflowRun,
        node: &WorkflowNode,
        inputs: Value,
        cancel: &Arc<Shutdown>,
    ) -> ExecutionResult {
        let Some(adapter) = self.adapters.get(&node.node_type) else {
            return ExecutionResult::fail(
                format!("no adapter registered for '{}'", node.node_type),
                0,
            );
        };

        let credential_secret = match &node.credential_id {
            Some(credential_id) => {
                match self.credentials.decrypt(&run.tenant_id, credential_id) {
                    Ok(secret) => Some(secret),
                    Err(e) => {
                        return ExecutionResult::fail(format!("credential: {}", e), 0);
                    }
                }
            }
            None => None,
        };

        let context = AdapterContext {
            tenant_id: run.tenant_id.clone(),
            run_metadata: RunMetadata {
                run_id: run.id.clone(),
                node_id: node.id.clone(),
            },
            node_config: node.config.clone(),
            inputs,
            credential_secret,
            cancellation: cancel.clone(),
        };

        let timeout = Duration::from_millis(
            node.timeout_ms.unwrap_or(self.options.default_node_timeout_ms),
        );
        match tokio::time::timeout(timeout, adapter.execute(context)).await {
            Ok(result) => result,
            Err(_) => {
                let mut result = ExecutionResult::fail(
                    format!("node timed out after {}ms", timeout.as_millis()),
                    timeout.as_millis() as u64,
                );
                result
                    .metadata
                    .insert("timeout".into(), Value::Bool(true));
                result
            }
        }
    }

    fn publish_node_finished(
        &self,
        run: &WorkflowRun,
        workflow: &Workflow,
        node_id: &str,
        status: NodeStatus,
        duration_ms: u64,
    ) {
        self.bus.publish(
            RunEventKind::NodeFinished,
            &run.tenant_id,
            &workflow.id,
            &run.id,
            Some(node_id),
            json!({ "status": status, "durationMs": duration_ms }),
        );
    }
}

/// Topological layer per node over the non-loop-back graph (longest path
/// from a source).
fn topological_layers(workflow: &Workflow) -> HashMap<&str, usize> {
    let mut in_degree: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), 0))
        .collect();
    for edge in workflow.edges.iter().filter(|e| !e.is_loop_back) {
        if in_degree.contains_key(edge.from.as_str()) {
            if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut layers: HashMap<&str, usize> = HashMap::new();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    for id in &queue {
        layers.insert(id, 0);
    }

    while let Some(id) = queue.pop_front() {
        let layer = layers.get(id).copied().unwrap_or(0);
        for edge in workflow.successors(id) {
            let entry = layers.entry(edge.to.as_str()).or_insert(0);
            *entry = (*entry).max(layer + 1);
            if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
    }
    layers
}

/// The structured inputs a node sees: run input fields and globals at top
/// level, predecessor outputs flattened in (later edges win), plus `input`
/// and `nodes` maps for explicit paths.
fn build_inputs(
    run: &WorkflowRun,
    workflow: &Workflow,
    node: &WorkflowNode,
    outputs: &HashMap<String, Value>,
) -> Value {
    let mut map = serde_json::Map::new();

    for (k, v) in &workflow.globals {
        map.insert(k.clone(), v.clone());
    }
    if let Value::Object(input) = &run.input {
        for (k, v) in input {
            map.insert(k.clone(), v.clone());
        }
    }
    for edge in workflow.predecessors(&node.id) {
        if let Some(Value::Object(output)) = outputs.get(&edge.from) {
            for (k, v) in output {
                map.insert(k.clone(), v.clone());
            }
        }
    }

    map.insert("input".into(), run.input.clone());
    map.insert(
        "nodes".into(),
        Value::Object(outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    Value::Object(map)
}

fn edge_condition_context(outputs: &HashMap<String, Value>, from: &str) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(Value::Object(output)) = outputs.get(from) {
        for (k, v) in output {
            map.insert(k.clone(), v.clone());
        }
    }
    map.insert(
        "output".into(),
        outputs.get(from).cloned().unwrap_or(Value::Null),
    );
    Value::Object(map)
}

fn loop_iteration_context(inputs: &Value, item: &Value, index: u32, last_output: &Value) -> Value {
    let mut map = match inputs {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("item".into(), item.clone());
    map.insert("index".into(), json!(index));
    map.insert("lastOutput".into(), last_output.clone());
    Value::Object(map)
}

fn node_status_for(result: &ExecutionResult) -> NodeStatus {
    if result.success {
        NodeStatus::Success
    } else if result.metadata.get("timeout").is_some() {
        NodeStatus::Timeout
    } else {
        NodeStatus::Failed
    }
}

fn skipped_result(run_id: &str, node_id: &str, input: Value) -> NodeExecutionResult {
    NodeExecutionResult {
        run_id: run_id.to_string(),
        node_id: node_id.to_string(),
        status: NodeStatus::Skipped,
        input,
        output: None,
        error_message: None,
        start_time: Utc::now(),
        end_time: Some(Utc::now()),
        attempt: 1,
    }
}
