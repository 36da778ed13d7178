//! End-to-end orchestration tests.
//!
//! Drives analyze → plan → execute against a mock dispatcher that answers
//! deterministically per worker type, with configurable failures and delays.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_messaging::{HistoryFilter, MessageKind};
use ensemble_orchestrator::*;
use ensemble_security::{CapabilityRegistry, NestedBudget, SafetyLimits, SafetyManager, WorkerType};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockDispatcher {
    /// Labels whose dispatch returns an error.
    failing: BTreeSet<String>,
    /// Labels whose dispatch sleeps before answering.
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<DispatchRequest>>,
}

impl MockDispatcher {
    fn new() -> Self {
        Self::default()
    }

    fn failing(mut self, labels: &[&str]) -> Self {
        self.failing.extend(labels.iter().map(|l| (*l).to_string()));
        self
    }

    fn delayed(mut self, label: &str, delay: Duration) -> Self {
        self.delays.insert(label.to_string(), delay);
        self
    }

    fn calls(&self) -> Vec<DispatchRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn call_for(&self, label: &str) -> Option<DispatchRequest> {
        self.calls().into_iter().find(|c| c.label == label)
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> EnsembleResult<String> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delays.get(&request.label) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&request.label) {
            return Err(EnsembleError::DispatchFailure(format!(
                "{} could not finish",
                request.label
            )));
        }
        Ok(format!("[{}] {}", request.worker_type, request.label))
    }
}

fn orchestrator(limits: SafetyLimits, dispatcher: Arc<MockDispatcher>) -> Orchestrator {
    Orchestrator::new(
        Arc::new(CapabilityRegistry::builtin()),
        Arc::new(SafetyManager::new(limits)),
        dispatcher,
    )
    .unwrap()
}

fn node(label: &str, worker_type: WorkerType, phase: u32) -> TaskNode {
    TaskNode::new(label, Task::new(format!("do {label}")), worker_type, phase)
}

/// A phase 0 of `width` backend nodes named `w1..`, followed by one reviewer
/// depending on all of them.
fn wide_graph(width: usize) -> (TaskGraph, Vec<NodeId>, NodeId) {
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let first: Vec<NodeId> = (1..=width)
        .map(|i| graph.add_node(node(&format!("w{i}"), WorkerType::BackendDeveloper, 0)))
        .collect();
    let review = graph.add_node(node("review", WorkerType::CodeReviewer, 1));
    for id in &first {
        graph.add_dependency(*id, review).unwrap();
    }
    (graph, first, review)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_trivial_task_runs_as_single_node() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));

    let analysis = orch.analyze("fix a typo in the README");
    assert!(analysis.score <= orch.planner().thresholds().simple);

    let result = orch.run("fix a typo in the README").await.unwrap();
    assert_eq!(result.strategy, PlanStrategy::Single);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.results.len(), 1);
    assert!(result.graph.edges().is_empty());

    let calls = dispatcher.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].dependency_outputs.is_empty());
    assert_eq!(calls[0].description, "fix a typo in the README");
}

#[tokio::test]
async fn test_complex_task_runs_every_dynamic_phase() {
    let text = "build a secure real-time chat platform with payments and mobile apps";
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));

    let analysis = orch.analyze(text);
    assert!(analysis.score >= 9);
    let graph = orch.plan(text, &analysis).unwrap();
    assert_eq!(graph.strategy, PlanStrategy::Dynamic);
    assert!(graph.phase_count() >= 4);
    assert!(graph.nodes().any(|n| n.worker_type == WorkerType::SecuritySpecialist));
    let node_count = graph.len();

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.results.len(), node_count);
    assert_eq!(orch.safety().live_count(), 0);
    assert_eq!(orch.safety().stats().approved, node_count as u64);

    // Phases ran in order.
    let phases: Vec<u32> = result.results.iter().map(|r| r.phase).collect();
    let mut sorted = phases.clone();
    sorted.sort_unstable();
    assert_eq!(phases, sorted);

    // Every output landed in the session.
    let context = orch.session().snapshot().context;
    for r in &result.results {
        assert!(context.contains_key(&r.key), "missing {}", r.key);
    }
}

#[tokio::test]
async fn test_spawn_denial_fails_only_that_branch() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(
        SafetyLimits::default().with_max_total_workers(2),
        Arc::clone(&dispatcher),
    );
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let ids: Vec<NodeId> = ["a", "b", "c"]
        .iter()
        .map(|l| graph.add_node(node(l, WorkerType::BackendDeveloper, 0)))
        .collect();

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Partial);
    assert_eq!(result.succeeded(), 2);

    let denied = result.result_for(ids[2]).unwrap();
    assert_eq!(denied.failure_reason(), Some(FailureReason::SafetyDenied));
    assert_eq!(
        denied.outcome,
        NodeOutcome::Failed {
            reason: FailureReason::SafetyDenied,
            message: "max agents reached".to_string(),
        }
    );
    assert!(denied.worker_id.is_none());
    assert_eq!(dispatcher.calls().len(), 2);
    assert_eq!(orch.safety().stats().denied, 1);
    assert_eq!(result.graph.node(ids[2]).unwrap().task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_majority_failure_halts_before_next_phase() {
    let dispatcher = Arc::new(MockDispatcher::new().failing(&["w1", "w2", "w3"]));
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let (graph, first, review) = wide_graph(4);

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.halted_at, Some(0));
    assert_eq!(result.results.len(), 4);
    assert!(result.results.iter().all(|r| r.phase == 0));
    assert!(result.result_for(review).is_none());
    assert_eq!(result.skipped, vec![review]);
    assert_eq!(result.graph.node(review).unwrap().task.status, TaskStatus::Skipped);
    assert_eq!(
        result.result_for(first[0]).unwrap().failure_reason(),
        Some(FailureReason::DispatchFailure)
    );
    assert!(dispatcher.call_for("review").is_none());
    assert_eq!(orch.safety().live_count(), 0);
}

#[tokio::test]
async fn test_half_failure_continues_with_surviving_outputs() {
    let dispatcher = Arc::new(MockDispatcher::new().failing(&["w1", "w2"]));
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let (graph, _, review) = wide_graph(4);

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Partial);
    assert!(result.result_for(review).unwrap().is_success());

    let call = dispatcher.call_for("review").unwrap();
    let keys: Vec<&str> = call.dependency_outputs.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["phase-0/w3", "phase-0/w4"]);
}

#[tokio::test]
async fn test_node_with_only_failed_dependencies_is_not_dispatched() {
    let dispatcher = Arc::new(MockDispatcher::new().failing(&["brief"]));
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let brief = graph.add_node(node("brief", WorkerType::ProductManager, 0));
    let design = graph.add_node(node("design", WorkerType::Architect, 0));
    let build = graph.add_node(node("build", WorkerType::BackendDeveloper, 1));
    let ship = graph.add_node(node("ship", WorkerType::DevopsEngineer, 1));
    graph.add_dependency(brief, build).unwrap();
    graph.add_dependency(brief, ship).unwrap();
    graph.add_dependency(design, ship).unwrap();

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Partial);
    assert_eq!(
        result.result_for(build).unwrap().failure_reason(),
        Some(FailureReason::DependencyFailed)
    );
    assert!(dispatcher.call_for("build").is_none());
    let ship_call = dispatcher.call_for("ship").unwrap();
    assert_eq!(ship_call.dependency_outputs.len(), 1);
    assert!(ship_call.dependency_outputs.contains_key("phase-0/design"));
}

// ---------------------------------------------------------------------------
// Timeouts and abort
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_slow_dispatch_times_out() {
    let dispatcher = Arc::new(MockDispatcher::new().delayed("w2", Duration::from_secs(30)));
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher)).with_options(
        ExecutionOptions {
            dispatch_timeout: Duration::from_secs(1),
            handoff_between_phases: false,
            ..ExecutionOptions::default()
        },
    );
    let (graph, first, review) = wide_graph(3);

    let result = orch.execute(graph).await.unwrap();
    let slow = result.result_for(first[1]).unwrap();
    assert_eq!(slow.failure_reason(), Some(FailureReason::DispatchTimeout));
    match &slow.outcome {
        NodeOutcome::Failed { message, .. } => assert!(message.contains("1000 ms")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(result.result_for(review).unwrap().is_success());
    assert_eq!(result.status, ExecutionStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn test_abort_cancels_phase_and_skips_the_rest() {
    let dispatcher = Arc::new(
        MockDispatcher::new()
            .delayed("w1", Duration::from_secs(60))
            .delayed("w2", Duration::from_secs(60)),
    );
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let abort = orch.abort_handle();
    let (graph, first, review) = wide_graph(2);

    let (result, ()) = tokio::join!(orch.execute(graph), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.abort();
    });
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Aborted);
    for id in &first {
        assert_eq!(
            result.result_for(*id).unwrap().failure_reason(),
            Some(FailureReason::Aborted)
        );
    }
    assert_eq!(result.skipped, vec![review]);
    assert_eq!(orch.safety().live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_execute_releases_its_workers() {
    let dispatcher = Arc::new(
        MockDispatcher::new()
            .delayed("w1", Duration::from_secs(60))
            .delayed("w2", Duration::from_secs(60)),
    );
    let orch = Orchestrator::from_config(
        &OrchestratorConfig {
            safety: SafetyLimits::default().with_max_total_workers(2),
            ..OrchestratorConfig::default()
        },
        dispatcher.clone(),
    )
    .unwrap();
    let (graph, _, _) = wide_graph(2);

    let cut_short = tokio::time::timeout(Duration::from_secs(1), orch.execute(graph)).await;
    assert!(cut_short.is_err());
    assert_eq!(dispatcher.calls().len(), 2);
    assert_eq!(orch.safety().live_count(), 0);
    assert_eq!(orch.safety().stats().torn_down, 2);
    let messenger = orch.messenger().unwrap();
    for call in dispatcher.calls() {
        assert!(!messenger.is_registered(call.worker_id));
    }

    // The freed slots serve the next run.
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    graph.add_node(node("a", WorkerType::BackendDeveloper, 0));
    graph.add_node(node("b", WorkerType::QaEngineer, 0));
    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result
        .results
        .iter()
        .all(|r| r.failure_reason() != Some(FailureReason::SafetyDenied)));
}

// ---------------------------------------------------------------------------
// Nesting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_nested_node_runs_under_its_own_worker() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let meta = graph.add_node(TaskNode::nested("meta", "fix a typo in the README", 0));

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let output = result.result_for(meta).unwrap().output().unwrap();
    let nested: HashMap<String, String> = serde_json::from_str(output).unwrap();
    assert_eq!(nested.len(), 1);
    assert!(nested.keys().all(|k| k.starts_with("phase-0/meta/task/")));

    // The meta worker plus its one child went through the same gate.
    assert_eq!(orch.safety().stats().approved, 2);
    assert_eq!(orch.safety().live_count(), 0);
    assert_eq!(dispatcher.calls().len(), 1);
}

#[tokio::test]
async fn test_nested_graph_beyond_its_budget_is_denied() {
    let text = "build a secure real-time chat platform with payments and mobile apps";
    let dispatcher = Arc::new(MockDispatcher::new());
    let limits = SafetyLimits::default().with_nested(NestedBudget {
        max_children: 2,
        ..NestedBudget::default()
    });
    let orch = orchestrator(limits, Arc::clone(&dispatcher));
    let planned = orch.plan(text, &orch.analyze(text)).unwrap();
    assert!(planned.len() > 2);

    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    graph.add_node(TaskNode::nested("meta", text, 0));
    orch.execute(graph).await.unwrap();

    // The meta worker plus the two children its budget allows.
    assert_eq!(orch.safety().stats().approved, 3);
    assert!(orch.safety().stats().denied >= 1);
    assert_eq!(dispatcher.calls().len(), 2);
    assert_eq!(orch.safety().live_count(), 0);
}

#[tokio::test]
async fn test_nested_outputs_do_not_shadow_outer_keys() {
    let text = "fix a typo in the README";
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let planned = orch.plan(text, &orch.analyze(text)).unwrap();
    let inner = planned.nodes().next().unwrap().clone();

    // An outer node with the very stage and label the nested plan uses.
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let outer = graph.add_node(
        TaskNode::new(inner.label.clone(), Task::new("outer work"), inner.worker_type, 0)
            .with_stage(inner.stage.clone()),
    );
    graph.add_node(TaskNode::nested("meta", text, 0));
    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let outer_key = result.result_for(outer).unwrap().key.clone();
    let nested_key = format!("phase-0/meta/{}", inner.context_key());
    assert_eq!(outer_key, inner.context_key());
    let session = orch.session();
    let outer_writers = session.history_of(&outer_key);
    let nested_writers = session.history_of(&nested_key);
    assert_eq!(outer_writers.len(), 1);
    assert_eq!(nested_writers.len(), 1);
    assert_ne!(outer_writers[0].1, nested_writers[0].1);
}

#[tokio::test]
async fn test_nested_workers_share_the_depth_budget() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default().with_max_depth(0), Arc::clone(&dispatcher));
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let meta = graph.add_node(TaskNode::nested("meta", "fix a typo in the README", 0));

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    let meta_result = result.result_for(meta).unwrap();
    assert_eq!(meta_result.failure_reason(), Some(FailureReason::DispatchFailure));
    assert!(dispatcher.calls().is_empty());
    assert_eq!(orch.safety().stats().denied, 1);
    assert_eq!(orch.safety().live_count(), 0);
}

// ---------------------------------------------------------------------------
// Session, messenger and monitor integration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_later_phases_see_earlier_outputs_as_relevant() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let mut graph = TaskGraph::new(PlanStrategy::Custom);
    let design = graph.add_node(node("design", WorkerType::Architect, 0).with_stage("architecture"));
    let build = graph.add_node(node("build", WorkerType::BackendDeveloper, 1).with_stage("development"));
    graph.add_dependency(design, build).unwrap();

    orch.execute(graph).await.unwrap();
    let call = dispatcher.call_for("build").unwrap();
    assert!(call.context.relevant.contains_key("architecture/design"));
    assert!(call.context.full.contains_key("architecture/design"));
    assert_eq!(
        call.dependency_outputs["architecture/design"],
        "[architect] design"
    );
}

#[tokio::test]
async fn test_config_built_orchestrator_introduces_workers_by_handoff() {
    let dispatcher = Arc::new(MockDispatcher::new());
    let orch = Orchestrator::from_config(&OrchestratorConfig::default(), dispatcher.clone()).unwrap();
    let (graph, _, _) = wide_graph(2);

    let result = orch.execute(graph).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let messenger = orch.messenger().unwrap();
    assert_eq!(messenger.primary(), Some(orch.id()));
    let intros = messenger.history(&HistoryFilter {
        kind: Some(MessageKind::Introduction),
        ..Default::default()
    });
    assert_eq!(intros.len(), 3);
    assert!(intros.iter().all(|m| m.from == orch.id()));
    // The reviewer's introduction summarizes phase-0 outputs.
    assert!(intros[2].content.contains("phase-0/w1"));

    // Each dispatched worker received the handoff that introduced it.
    for call in dispatcher.calls() {
        let handoff = call.context.last_handoff.unwrap();
        assert_eq!(handoff.to, call.worker_id);
    }
    // Mailboxes are dropped with the workers.
    for r in &result.results {
        assert!(!messenger.is_registered(r.worker_id.unwrap()));
    }
}

#[tokio::test]
async fn test_monitor_counts_dispatches_per_worker_type() {
    let dispatcher = Arc::new(MockDispatcher::new().failing(&["w2"]));
    let orch = orchestrator(SafetyLimits::default(), Arc::clone(&dispatcher));
    let (graph, _, _) = wide_graph(3);
    orch.execute(graph).await.unwrap();

    let backend = orch.monitor().get(WorkerType::BackendDeveloper).await.unwrap();
    assert_eq!(backend.dispatched, 3);
    assert_eq!(backend.succeeded, 2);
    assert_eq!(backend.failed, 1);
    assert_eq!(backend.active, 0);
    let reviewer = orch.monitor().get(WorkerType::CodeReviewer).await.unwrap();
    assert_eq!(reviewer.succeeded, 1);
}

// ---------------------------------------------------------------------------
// Planning properties
// ---------------------------------------------------------------------------

const TEXTS: &[&str] = &[
    "",
    "fix a typo in the README",
    "add a login form",
    "build a distributed backend with microservices and frontend",
    "create a secure login api with oauth",
    "implement secure payments with oauth, encryption and a REST api for several mobile apps",
    "build a secure real-time chat platform with payments and mobile apps",
    "migrate the data warehouse ETL pipeline to a new schema",
];

#[test]
fn test_analysis_and_plans_are_deterministic() {
    let orch = orchestrator(SafetyLimits::default(), Arc::new(MockDispatcher::new()));
    for text in TEXTS {
        let first = orch.analyze(text);
        assert_eq!(first, orch.analyze(text), "{text}");
        let plan_a = orch.plan(text, &first).unwrap();
        let plan_b = orch.plan(text, &first).unwrap();
        assert_eq!(plan_a, plan_b, "{text}");
    }
}

#[test]
fn test_plans_are_acyclic_and_phase_ordered() {
    let orch = orchestrator(SafetyLimits::default(), Arc::new(MockDispatcher::new()));
    for text in TEXTS {
        let analysis = orch.analyze(text);
        let graph = orch.plan(text, &analysis).unwrap();
        let order = graph.topological_order().unwrap();
        assert_eq!(order.len(), graph.len());
        for n in graph.nodes() {
            for dep in &n.dependencies {
                assert!(graph.node(*dep).unwrap().phase < n.phase, "{text}");
            }
        }
    }
}
