//! Complexity analysis, workflow planning and phase-barrier execution.
//!
//! Turns a free-text task into a [`TaskGraph`] and runs it phase by phase,
//! spawning one worker per node through a shared
//! [`SafetyManager`](ensemble_security::SafetyManager) and dispatching it to
//! an external [`Dispatcher`].
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade composing `analyze`, `plan` and `execute`.
//! - [`ComplexityAnalyzer`] — Scores task text through a pluggable [`Classifier`].
//! - [`WorkflowPlanner`] — Chooses a strategy and builds the [`TaskGraph`].
//! - [`Dispatcher`] — The external execution interface.
//! - [`OrchestratorConfig`] — TOML configuration for the whole stack.

/// Complexity scoring and the heuristic classifier.
pub mod analyzer;
/// TOML configuration.
pub mod config;
/// The external execution interface.
pub mod dispatch;
/// Phase-barrier execution and the orchestrator facade.
pub mod engine;
/// Task graph and its validation.
pub mod graph;
/// Per-worker-type dispatch metrics.
pub mod monitor;
/// Strategy selection and graph construction.
pub mod planner;
/// Built-in workflow templates.
pub mod templates;
/// Shared orchestration types.
pub mod types;

pub use analyzer::{Classifier, ComplexityAnalyzer, HeuristicClassifier};
pub use config::{ExecutionSettings, MessagingSettings, OrchestratorConfig};
pub use dispatch::{DispatchRequest, Dispatcher};
pub use engine::{
    AbortHandle, ExecutionOptions, ExecutionResult, ExecutionStatus, FailureReason, NodeOutcome,
    NodeResult, Orchestrator,
};
pub use graph::{TaskGraph, TaskNode};
pub use monitor::{WorkerMetrics, WorkerMonitor};
pub use planner::{Thresholds, WorkflowPlanner};
pub use templates::{builtin_templates, template_for, TemplateStep, WorkflowTemplate};
pub use types::{
    ComplexityAnalysis, Dimensions, Domain, EstimatedEffort, NodeId, PlanStrategy, Task,
    TaskStatus,
};
