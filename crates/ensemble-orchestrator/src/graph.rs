use crate::types::{NodeId, PlanStrategy, Task, TaskStatus};
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_security::{CapabilityRegistry, WorkerType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A node of the task graph: one task bound to one worker type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Assigned by [`TaskGraph::add_node`].
    pub id: NodeId,
    /// Short name, unique within its stage; used for context keys.
    pub label: String,
    /// The work to perform.
    pub task: Task,
    /// Who performs it; orchestrator for nested nodes.
    pub worker_type: WorkerType,
    /// Nodes sharing a phase run concurrently.
    pub phase: u32,
    /// Human-readable phase name (`discovery`, `development`, ...).
    pub stage: String,
    /// Nodes that must finish first; all in earlier phases.
    pub dependencies: BTreeSet<NodeId>,
    /// Unscaled duration estimate.
    pub base_minutes: u32,
    /// Executing this node runs a nested analyze, plan and execute cycle.
    #[serde(default)]
    pub nested: bool,
    /// Context key of the nested node this one was planned under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl TaskNode {
    /// A node with no id yet; [`TaskGraph::add_node`] assigns one.
    pub fn new(label: impl Into<String>, task: Task, worker_type: WorkerType, phase: u32) -> Self {
        Self {
            id: NodeId(0),
            label: label.into(),
            task,
            worker_type,
            phase,
            stage: format!("phase-{phase}"),
            dependencies: BTreeSet::new(),
            base_minutes: 60,
            nested: false,
            scope: None,
        }
    }

    /// A meta-orchestration node whose description is planned and executed
    /// under the node's own worker.
    pub fn nested(label: impl Into<String>, description: impl Into<String>, phase: u32) -> Self {
        let mut node = Self::new(label, Task::new(description), WorkerType::Orchestrator, phase);
        node.nested = true;
        node
    }

    /// Set the stage name.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Set the duration estimate.
    pub fn with_base_minutes(mut self, minutes: u32) -> Self {
        self.base_minutes = minutes;
        self
    }

    /// Session context key this node's output is written under.
    ///
    /// Nodes of a nested workflow are prefixed with the key of the node that
    /// planned them, so they never overwrite the outer graph's entries.
    pub fn context_key(&self) -> String {
        format!("{}{}", self.stage_prefix(), self.label)
    }

    /// Key prefix shared by every node of this node's stage.
    pub fn stage_prefix(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}/{}/", self.stage),
            None => format!("{}/", self.stage),
        }
    }

    /// Context key of the nested node this one runs under.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

/// Dependency graph of tasks for one workflow run.
///
/// An edge `(from, to)` means `from` must complete before `to` is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    /// How the graph was produced.
    pub strategy: PlanStrategy,
    nodes: BTreeMap<NodeId, TaskNode>,
    next_id: u32,
}

impl TaskGraph {
    /// An empty graph.
    pub fn new(strategy: PlanStrategy) -> Self {
        Self {
            strategy,
            nodes: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Insert `node`, assigning it a fresh id.
    pub fn add_node(&mut self, mut node: TaskNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        node.id = id;
        self.nodes.insert(id, node);
        id
    }

    /// Make `to` depend on `from`.
    pub fn add_dependency(&mut self, from: NodeId, to: NodeId) -> EnsembleResult<()> {
        if !self.nodes.contains_key(&from) {
            return Err(EnsembleError::Planning(format!("unknown node {from}")));
        }
        let node = self
            .nodes
            .get_mut(&to)
            .ok_or_else(|| EnsembleError::Planning(format!("unknown node {to}")))?;
        node.dependencies.insert(from);
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    /// Edit a node's task payload. Structure (id, phase, edges) stays fixed.
    pub fn task_mut(&mut self, id: NodeId) -> Option<&mut Task> {
        self.nodes.get_mut(&id).map(|n| &mut n.task)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every `(from, to)` dependency edge.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.nodes
            .values()
            .flat_map(|n| n.dependencies.iter().map(move |d| (*d, n.id)))
            .collect()
    }

    /// Nodes without dependencies.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Nodes that depend directly on `id`.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Node ids grouped by phase, phases ascending.
    pub fn phases(&self) -> Vec<(u32, Vec<NodeId>)> {
        let mut grouped: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            grouped.entry(node.phase).or_default().push(node.id);
        }
        grouped.into_iter().collect()
    }

    /// Number of distinct phases.
    pub fn phase_count(&self) -> usize {
        self.phases().len()
    }

    /// Size of the widest phase.
    pub fn max_width(&self) -> usize {
        self.phases().iter().map(|(_, ids)| ids.len()).max().unwrap_or(0)
    }

    /// Kahn's algorithm; ties broken by node id.
    pub fn topological_order(&self) -> EnsembleResult<Vec<NodeId>> {
        let mut remaining: BTreeMap<NodeId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.dependencies.len()))
            .collect();
        let mut ready: VecDeque<NodeId> = remaining
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in self.dependents(id) {
                if let Some(deg) = remaining.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(EnsembleError::Planning(
                "dependency cycle detected in task graph".to_string(),
            ));
        }
        Ok(order)
    }

    /// Check structural invariants: endpoints exist, every dependency lives
    /// in a strictly earlier phase, and the graph is acyclic.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.nodes.is_empty() {
            return Err(EnsembleError::Planning("task graph is empty".to_string()));
        }
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                let dep_node = self.nodes.get(dep).ok_or_else(|| {
                    EnsembleError::Planning(format!("node {} depends on unknown node {dep}", node.id))
                })?;
                if dep_node.phase >= node.phase {
                    return Err(EnsembleError::Planning(format!(
                        "node {} (phase {}) depends on {dep} (phase {}) which is not in an earlier phase",
                        node.id, node.phase, dep_node.phase
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Fail with `UnknownWorkerType` if any node uses a type the registry lacks.
    pub fn validate_workers(&self, registry: &CapabilityRegistry) -> EnsembleResult<()> {
        for node in self.nodes.values() {
            registry.require(node.worker_type)?;
        }
        Ok(())
    }

    /// Sum over phases of the slowest node in each phase, scaled by each
    /// worker type's complexity multiplier.
    pub fn estimated_minutes(&self, registry: &CapabilityRegistry) -> u64 {
        self.phases()
            .iter()
            .map(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| self.nodes.get(id))
                    .map(|n| {
                        let multiplier = registry
                            .describe(n.worker_type)
                            .map_or(1.0, |d| d.complexity_multiplier);
                        (f64::from(n.base_minutes) * multiplier).ceil() as u64
                    })
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Place every node under `scope`; see [`TaskNode::context_key`].
    pub(crate) fn scope_under(&mut self, scope: &str) {
        for node in self.nodes.values_mut() {
            node.scope = Some(scope.to_string());
        }
    }

    /// Update one node's task status.
    pub(crate) fn set_status(&mut self, id: NodeId, status: TaskStatus) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.task.status = status;
        }
    }
}
