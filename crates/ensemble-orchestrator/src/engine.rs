use crate::analyzer::ComplexityAnalyzer;
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::graph::{TaskGraph, TaskNode};
use crate::monitor::WorkerMonitor;
use crate::planner::{Thresholds, WorkflowPlanner};
use crate::templates::WorkflowTemplate;
use crate::types::{ComplexityAnalysis, NodeId, PlanStrategy, TaskStatus};
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult, WorkerId};
use ensemble_messaging::{HandoffOptions, Messenger};
use ensemble_security::{
    CapabilityRegistry, SafetyManager, SpawnDecision, WorkerHandle, WorkerStatus, WorkerType,
};
use ensemble_session::{ContextMap, Session};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a node did not produce an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The safety manager refused a worker.
    SafetyDenied,
    /// The dispatcher did not answer in time.
    DispatchTimeout,
    /// The dispatcher or a nested workflow returned an error.
    DispatchFailure,
    /// Every dependency failed, so the node was never dispatched.
    DependencyFailed,
    /// Cancelled by the abort handle.
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::SafetyDenied => "safety-denied",
            FailureReason::DispatchTimeout => "dispatch-timeout",
            FailureReason::DispatchFailure => "dispatch-failure",
            FailureReason::DependencyFailed => "dependency-failed",
            FailureReason::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// What a node produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The worker answered.
    Success {
        /// Dispatcher output, also written to the session.
        output: String,
    },
    /// No output was produced.
    Failed {
        /// Failure class.
        reason: FailureReason,
        /// Human-readable detail, e.g. the deny reason or dispatcher error.
        message: String,
    },
}

impl NodeOutcome {
    fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        NodeOutcome::Failed {
            reason,
            message: message.into(),
        }
    }
}

/// The recorded result of one graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Node this result belongs to.
    pub node_id: NodeId,
    /// Session context key the output was written under.
    pub key: String,
    /// Phase the node ran in.
    pub phase: u32,
    /// Worker type the node asked for.
    pub worker_type: WorkerType,
    /// Absent when no worker was ever spawned for the node.
    pub worker_id: Option<WorkerId>,
    /// Output or failure.
    pub outcome: NodeOutcome,
    /// When the node was attempted.
    pub started_at: DateTime<Utc>,
    /// When its outcome was recorded.
    pub ended_at: DateTime<Utc>,
}

impl NodeResult {
    fn new(node: &TaskNode, worker_id: Option<WorkerId>, outcome: NodeOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node.id,
            key: node.context_key(),
            phase: node.phase,
            worker_type: node.worker_type,
            worker_id,
            outcome,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Whether the node produced an output.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Success { .. })
    }

    /// The output, on success.
    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            NodeOutcome::Success { output } => Some(output),
            NodeOutcome::Failed { .. } => None,
        }
    }

    /// The failure class, on failure.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            NodeOutcome::Success { .. } => None,
            NodeOutcome::Failed { reason, .. } => Some(*reason),
        }
    }
}

/// Overall outcome of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every node succeeded.
    Completed,
    /// Every phase ran but some nodes failed.
    Partial,
    /// A phase lost the majority of its nodes and execution halted.
    Failed,
    /// An operator abort stopped the run.
    Aborted,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Everything one call to [`Orchestrator::execute`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Overall outcome.
    pub status: ExecutionStatus,
    /// How the executed graph was planned.
    pub strategy: PlanStrategy,
    /// One entry per node that was attempted, in phase then node order.
    pub results: Vec<NodeResult>,
    /// Nodes never attempted because execution stopped before their phase.
    pub skipped: Vec<NodeId>,
    /// Phase whose failures halted the run.
    pub halted_at: Option<u32>,
    /// The executed graph with final task statuses.
    pub graph: TaskGraph,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    /// End of the run.
    pub ended_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result of one node, if it was attempted.
    pub fn result_for(&self, node_id: NodeId) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node_id == node_id)
    }

    /// Number of nodes that produced an output.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Number of attempted nodes that did not.
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Successful outputs keyed by their session context key.
    pub fn outputs(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter_map(|r| r.output().map(|o| (r.key.clone(), o.to_string())))
            .collect()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} nodes succeeded, {} skipped ({})",
            self.succeeded(),
            self.graph.len(),
            self.skipped.len(),
            self.status
        )
    }
}

/// Knobs for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Bound on each call to the dispatcher.
    pub dispatch_timeout: Duration,
    /// Introduce each worker through the messenger's handoff protocol.
    pub handoff_between_phases: bool,
    /// Archive the session once [`Orchestrator::execute`] returns.
    pub archive_on_finish: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(300),
            handoff_between_phases: true,
            archive_on_finish: false,
        }
    }
}

/// Cancels a running workflow. Cloning shares the same signal.
///
/// Once aborted, an engine stays aborted; build a new one to run again.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Cancel every in-flight dispatch and skip the remaining phases.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Whether [`abort`](Self::abort) was called.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The multi-worker orchestrator.
///
/// Composes analysis, planning and phase-barrier execution. Callers may run
/// the whole pipeline with [`Orchestrator::run`] or inspect and adjust the
/// plan between [`Orchestrator::plan`] and [`Orchestrator::execute`].
pub struct Orchestrator {
    id: WorkerId,
    registry: Arc<CapabilityRegistry>,
    analyzer: ComplexityAnalyzer,
    planner: WorkflowPlanner,
    safety: Arc<SafetyManager>,
    dispatcher: Arc<dyn Dispatcher>,
    session: Arc<Session>,
    messenger: Option<Arc<Messenger>>,
    monitor: Arc<WorkerMonitor>,
    options: ExecutionOptions,
    abort: AbortHandle,
}

impl Orchestrator {
    /// Create an orchestrator with default thresholds, a fresh session and no messenger.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        safety: Arc<SafetyManager>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> EnsembleResult<Self> {
        Ok(Self {
            id: WorkerId::new(),
            analyzer: ComplexityAnalyzer::new(Arc::clone(&registry))?,
            planner: WorkflowPlanner::new(Arc::clone(&registry), Thresholds::default()),
            registry,
            safety,
            dispatcher,
            session: Arc::new(Session::new()),
            messenger: None,
            monitor: Arc::new(WorkerMonitor::new()),
            options: ExecutionOptions::default(),
            abort: AbortHandle::default(),
        })
    }

    /// Build everything a config describes, including a messenger whose
    /// primary is this orchestrator.
    pub fn from_config(config: &OrchestratorConfig, dispatcher: Arc<dyn Dispatcher>) -> EnsembleResult<Self> {
        config.validate()?;
        let registry = Arc::new(config.registry()?);
        let safety = Arc::new(SafetyManager::new(config.safety.clone()));
        let orchestrator = Self::new(registry, safety, dispatcher)?
            .with_thresholds(config.thresholds)
            .with_options(config.execution_options());
        let messenger = Messenger::new()
            .with_primary(orchestrator.id)
            .with_response_timeout(config.response_timeout());
        Ok(orchestrator.with_messenger(Arc::new(messenger)))
    }

    /// Replace the strategy thresholds, keeping the current templates.
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        let templates = self.planner.templates().to_vec();
        self.planner = WorkflowPlanner::new(Arc::clone(&self.registry), thresholds).with_templates(templates);
        self
    }

    /// Replace the planner's template set.
    pub fn with_templates(mut self, templates: Vec<WorkflowTemplate>) -> Self {
        self.planner = self.planner.with_templates(templates);
        self
    }

    /// Use a custom analyzer, e.g. one with its own classifier.
    pub fn with_analyzer(mut self, analyzer: ComplexityAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Share a session, e.g. one restored from a snapshot.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = session;
        self
    }

    /// Register this orchestrator on `messenger` and introduce workers through it.
    pub fn with_messenger(mut self, messenger: Arc<Messenger>) -> Self {
        messenger.register(self.id);
        self.messenger = Some(messenger);
        self
    }

    /// Share a monitor across orchestrators.
    pub fn with_monitor(mut self, monitor: Arc<WorkerMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replace the execution options.
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Identity used as the handoff sender and messenger primary.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Worker catalog.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// The spawn gate shared with nested runs.
    pub fn safety(&self) -> &Arc<SafetyManager> {
        &self.safety
    }

    /// Shared context all workers read and write.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The messenger, when one is attached.
    pub fn messenger(&self) -> Option<&Arc<Messenger>> {
        self.messenger.as_ref()
    }

    /// Dispatch metrics.
    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    /// The workflow planner.
    pub fn planner(&self) -> &WorkflowPlanner {
        &self.planner
    }

    /// Current execution options.
    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    /// A handle that aborts runs of this orchestrator.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Analyze a task description.
    pub fn analyze(&self, text: &str) -> ComplexityAnalysis {
        self.analyzer.analyze(text)
    }

    /// Plan a graph for an analyzed description.
    pub fn plan(&self, text: &str, analysis: &ComplexityAnalysis) -> EnsembleResult<TaskGraph> {
        self.planner.plan(text, analysis)
    }

    /// Execute a graph phase by phase.
    ///
    /// Planning-class errors (invalid graph, unknown worker type, closed
    /// session) are returned before anything runs. Everything that goes wrong
    /// afterwards is reported per node inside the [`ExecutionResult`].
    ///
    /// Dropping the returned future releases every worker it still holds.
    pub async fn execute(&self, graph: TaskGraph) -> EnsembleResult<ExecutionResult> {
        // Fails up front on an archived session.
        self.session.join(self.id, WorkerType::Orchestrator.as_str(), Vec::new())?;
        let result = self.execute_graph(graph, None).await?;
        if self.options.archive_on_finish {
            self.session.archive();
            debug!(session = %self.session.id(), "Session archived");
        }
        Ok(result)
    }

    /// Analyze, plan and execute a task description.
    pub async fn run(&self, text: &str) -> EnsembleResult<ExecutionResult> {
        info!(task = %text, "Orchestrator: starting pipeline");
        let analysis = self.analyze(text);
        let graph = self.plan(text, &analysis)?;
        let result = self.execute(graph).await?;
        info!(status = %result.status, summary = %result.summary(), "Orchestrator: pipeline complete");
        Ok(result)
    }

    fn execute_graph(
        &self,
        mut graph: TaskGraph,
        parent: Option<WorkerId>,
    ) -> BoxFuture<'_, EnsembleResult<ExecutionResult>> {
        async move {
            graph.validate()?;
            graph.validate_workers(&self.registry)?;

            let started_at = Utc::now();
            let coordinator = parent.unwrap_or(self.id);
            let phases = graph.phases();
            let mut results: Vec<NodeResult> = Vec::new();
            let mut outputs: HashMap<NodeId, (String, String)> = HashMap::new();
            let mut skipped: Vec<NodeId> = Vec::new();
            let mut halted_at = None;
            let mut stopped: Option<ExecutionStatus> = None;

            for (index, (phase, ids)) in phases.iter().enumerate() {
                if self.abort.is_aborted() {
                    stopped = Some(ExecutionStatus::Aborted);
                    skipped.extend(remaining(&phases, index));
                    break;
                }
                info!(phase, nodes = ids.len(), "Phase started");

                let mut phase_results = Vec::with_capacity(ids.len());
                let mut batch: Vec<(TaskNode, WorkerLease, BTreeMap<String, String>)> = Vec::new();
                for id in ids {
                    let Some(node) = graph.node(*id).cloned() else {
                        continue;
                    };
                    let dependency_outputs: BTreeMap<String, String> = node
                        .dependencies
                        .iter()
                        .filter_map(|dep| outputs.get(dep).cloned())
                        .collect();
                    if !node.dependencies.is_empty() && dependency_outputs.is_empty() {
                        warn!(node_id = %node.id, phase, "Every dependency failed; node not dispatched");
                        let outcome = NodeOutcome::failed(FailureReason::DependencyFailed, "every dependency failed");
                        phase_results.push(NodeResult::new(&node, None, outcome, Utc::now()));
                        continue;
                    }
                    match self.safety.request_spawn(parent, node.worker_type) {
                        SpawnDecision::Approved(handle) => {
                            graph.set_status(node.id, TaskStatus::Running);
                            batch.push((node, self.lease(handle), dependency_outputs));
                        }
                        SpawnDecision::Denied(reason) => {
                            warn!(node_id = %node.id, worker_type = %node.worker_type, %reason, "Node denied a worker");
                            let outcome = NodeOutcome::failed(FailureReason::SafetyDenied, reason.to_string());
                            phase_results.push(NodeResult::new(&node, None, outcome, Utc::now()));
                        }
                    }
                }

                let finished = join_all(
                    batch
                        .iter()
                        .map(|(node, lease, deps)| self.run_node(node, &lease.handle, deps.clone(), coordinator)),
                )
                .await;

                for ((node, lease, _), result) in batch.into_iter().zip(finished) {
                    let status = if result.is_success() {
                        WorkerStatus::Completed
                    } else {
                        WorkerStatus::Failed
                    };
                    lease.release(status);
                    if let Some(output) = result.output() {
                        outputs.insert(node.id, (node.context_key(), output.to_string()));
                    }
                    phase_results.push(result);
                }

                phase_results.sort_by_key(|r| r.node_id);
                let failed = phase_results.iter().filter(|r| !r.is_success()).count();
                for r in &phase_results {
                    let status = if r.is_success() { TaskStatus::Done } else { TaskStatus::Failed };
                    graph.set_status(r.node_id, status);
                }
                results.extend(phase_results);

                if self.abort.is_aborted() {
                    stopped = Some(ExecutionStatus::Aborted);
                    skipped.extend(remaining(&phases, index + 1));
                    break;
                }
                if failed * 2 > ids.len() {
                    error!(phase, failed, total = ids.len(), "Majority of phase failed; halting");
                    stopped = Some(ExecutionStatus::Failed);
                    halted_at = Some(*phase);
                    skipped.extend(remaining(&phases, index + 1));
                    break;
                }
                info!(phase, failed, total = ids.len(), "Phase finished");
            }

            for id in &skipped {
                graph.set_status(*id, TaskStatus::Skipped);
            }
            let status = stopped.unwrap_or(if results.iter().all(NodeResult::is_success) {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Partial
            });

            Ok(ExecutionResult {
                status,
                strategy: graph.strategy.clone(),
                results,
                skipped,
                halted_at,
                graph,
                started_at,
                ended_at: Utc::now(),
            })
        }
        .boxed()
    }

    async fn run_node(
        &self,
        node: &TaskNode,
        handle: &WorkerHandle,
        dependency_outputs: BTreeMap<String, String>,
        coordinator: WorkerId,
    ) -> NodeResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut interests: Vec<String> = dependency_outputs
            .keys()
            .filter_map(|key| key.rsplit_once('/').map(|(stage, _)| format!("{stage}/")))
            .collect();
        interests.push(node.stage_prefix());
        interests.sort();
        interests.dedup();

        if let Err(e) = self.introduce(node, handle.id, coordinator, interests) {
            error!(node_id = %node.id, error = %e, "Could not introduce worker");
            let outcome = NodeOutcome::failed(FailureReason::DispatchFailure, e.to_string());
            return NodeResult::new(node, Some(handle.id), outcome, started_at);
        }

        self.monitor.start(node.worker_type).await;
        let outcome = if node.nested {
            self.run_nested(node, handle).await
        } else {
            self.dispatch(node, handle, dependency_outputs).await
        };

        if let NodeOutcome::Success { output } = &outcome {
            let mut patch = ContextMap::new();
            patch.insert(node.context_key(), serde_json::Value::String(output.clone()));
            let reason = format!("{} completed", node.label);
            if let Err(e) = self.session.update_context(handle.id, patch, &reason) {
                warn!(node_id = %node.id, error = %e, "Output not recorded in session");
            }
        }
        let success = matches!(outcome, NodeOutcome::Success { .. });
        self.monitor
            .finish(node.worker_type, success, clock.elapsed().as_millis() as u64)
            .await;

        NodeResult::new(node, Some(handle.id), outcome, started_at)
    }

    fn introduce(
        &self,
        node: &TaskNode,
        worker: WorkerId,
        coordinator: WorkerId,
        interests: Vec<String>,
    ) -> EnsembleResult<()> {
        let role = node.worker_type.as_str();
        match &self.messenger {
            Some(messenger) if self.options.handoff_between_phases => {
                let options = HandoffOptions::new(format!("assigned {}", node.context_key()), role)
                    .with_interests(interests);
                messenger.handoff(coordinator, worker, &self.session, options)?;
            }
            _ => self.session.join(worker, role, interests)?,
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        node: &TaskNode,
        handle: &WorkerHandle,
        dependency_outputs: BTreeMap<String, String>,
    ) -> NodeOutcome {
        let context = match self.session.context_for(handle.id) {
            Ok(view) => view,
            Err(e) => return NodeOutcome::failed(FailureReason::DispatchFailure, e.to_string()),
        };
        let request = DispatchRequest {
            node_id: node.id,
            label: node.label.clone(),
            stage: node.stage.clone(),
            worker_id: handle.id,
            worker_type: node.worker_type,
            description: node.task.description.clone(),
            required_capabilities: node.task.required_capabilities.clone(),
            tools: self
                .registry
                .describe(node.worker_type)
                .map(|d| d.tools.clone())
                .unwrap_or_default(),
            context,
            dependency_outputs,
        };

        debug!(node_id = %node.id, worker_id = %handle.id, "Dispatching");
        let timeout_ms = self.options.dispatch_timeout.as_millis() as u64;
        let call = tokio::time::timeout(self.options.dispatch_timeout, self.dispatcher.dispatch(request));
        let outcome = tokio::select! {
            _ = self.abort.token.cancelled() => {
                NodeOutcome::failed(FailureReason::Aborted, "aborted by operator")
            }
            result = call => match result {
                Ok(Ok(output)) => NodeOutcome::Success { output },
                Ok(Err(e @ EnsembleError::DispatchTimeout { .. })) | Ok(Err(e @ EnsembleError::DeliveryTimeout { .. })) => {
                    NodeOutcome::failed(FailureReason::DispatchTimeout, e.to_string())
                }
                Ok(Err(e)) => NodeOutcome::failed(FailureReason::DispatchFailure, e.to_string()),
                Err(_) => NodeOutcome::failed(
                    FailureReason::DispatchTimeout,
                    EnsembleError::DispatchTimeout { timeout_ms }.to_string(),
                ),
            },
        };
        if let NodeOutcome::Failed { reason, message } = &outcome {
            error!(node_id = %node.id, worker_type = %node.worker_type, %reason, error = %message, "Dispatch failed");
        }
        outcome
    }

    /// Plan and execute the node's description underneath its own worker.
    ///
    /// The nested graph spawns under the node's handle with the nested budget
    /// of [`SafetyLimits`](ensemble_security::SafetyLimits) and writes its
    /// outputs below the node's own context key.
    async fn run_nested(&self, node: &TaskNode, handle: &WorkerHandle) -> NodeOutcome {
        let description = &node.task.description;
        let analysis = self.analyzer.analyze(description);
        let mut graph = match self.planner.plan(description, &analysis) {
            Ok(graph) => graph,
            Err(e) => {
                return NodeOutcome::failed(FailureReason::DispatchFailure, format!("nested planning failed: {e}"))
            }
        };
        graph.scope_under(&node.context_key());
        if let Err(e) = self.safety.apply_nested_budget(handle.id) {
            return NodeOutcome::failed(FailureReason::DispatchFailure, e.to_string());
        }
        info!(node_id = %node.id, depth = handle.depth, nodes = graph.len(), "Running nested workflow");

        match self.execute_graph(graph, Some(handle.id)).await {
            Ok(result) => match result.status {
                ExecutionStatus::Completed | ExecutionStatus::Partial => {
                    let output = serde_json::to_string(&result.outputs()).unwrap_or_else(|_| result.summary());
                    NodeOutcome::Success { output }
                }
                ExecutionStatus::Aborted => NodeOutcome::failed(FailureReason::Aborted, result.summary()),
                ExecutionStatus::Failed => NodeOutcome::failed(
                    FailureReason::DispatchFailure,
                    format!("nested workflow failed: {}", result.summary()),
                ),
            },
            Err(e) => NodeOutcome::failed(FailureReason::DispatchFailure, format!("nested workflow failed: {e}")),
        }
    }

    fn lease(&self, handle: WorkerHandle) -> WorkerLease {
        WorkerLease {
            handle,
            safety: Arc::clone(&self.safety),
            messenger: self.messenger.clone(),
            armed: true,
        }
    }
}

/// An approved worker slot, held for as long as its node runs.
///
/// [`release`](Self::release) hands the slot back with the node's status. A
/// lease dropped while still held, because the execute future was dropped
/// mid-phase, tears its subtree down instead.
struct WorkerLease {
    handle: WorkerHandle,
    safety: Arc<SafetyManager>,
    messenger: Option<Arc<Messenger>>,
    armed: bool,
}

impl WorkerLease {
    fn release(mut self, status: WorkerStatus) {
        self.armed = false;
        let id = self.handle.id;
        if let Err(e) = self.safety.unregister(id, status) {
            warn!(worker_id = %id, error = %e, "Unregister failed; tearing down subtree");
            if let Err(e) = self.safety.teardown(id) {
                warn!(worker_id = %id, error = %e, "Teardown failed");
            }
        }
        self.close_mailbox();
    }

    fn close_mailbox(&self) {
        if let Some(messenger) = &self.messenger {
            messenger.unregister(self.handle.id);
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.handle.id;
        // A nested parent may already have taken this worker down with its subtree.
        match self.safety.teardown(id) {
            Ok(removed) => warn!(worker_id = %id, removed = removed.len(), "Worker dropped mid-run; released"),
            Err(e) => debug!(worker_id = %id, error = %e, "Dropped worker already released"),
        }
        self.close_mailbox();
    }
}

/// Node ids of every phase from `from` onwards.
fn remaining(phases: &[(u32, Vec<NodeId>)], from: usize) -> Vec<NodeId> {
    phases
        .iter()
        .skip(from)
        .flat_map(|(_, ids)| ids.iter().copied())
        .collect()
}
