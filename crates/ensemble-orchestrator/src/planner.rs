use crate::graph::{TaskGraph, TaskNode};
use crate::templates::{self, WorkflowTemplate};
use crate::types::{ComplexityAnalysis, NodeId, PlanStrategy, Task};
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_security::{Capability, CapabilityRegistry, WorkerType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Score boundaries between planning strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// At or below: single node.
    pub simple: u8,
    /// At or below: short linear chain.
    pub moderate: u8,
    /// At or below: template. Above: dynamic phases.
    pub complex: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            simple: 3,
            moderate: 6,
            complex: 8,
        }
    }
}

impl Thresholds {
    /// Require `1 <= simple < moderate < complex <= 10`.
    pub fn validate(&self) -> EnsembleResult<()> {
        if !(1 <= self.simple && self.simple < self.moderate && self.moderate < self.complex && self.complex <= 10) {
            return Err(EnsembleError::Config(format!(
                "thresholds must satisfy 1 <= simple < moderate < complex <= 10 (got {}, {}, {})",
                self.simple, self.moderate, self.complex
            )));
        }
        Ok(())
    }
}

/// Unscaled minutes a worker type spends on one step.
pub fn base_minutes(worker_type: WorkerType) -> u32 {
    match worker_type {
        WorkerType::Orchestrator => 15,
        WorkerType::ProductManager => 30,
        WorkerType::Architect => 45,
        WorkerType::BackendDeveloper | WorkerType::FrontendDeveloper | WorkerType::MobileDeveloper => 120,
        WorkerType::UxDesigner => 60,
        WorkerType::QaEngineer => 60,
        WorkerType::SecuritySpecialist => 60,
        WorkerType::DataEngineer => 90,
        WorkerType::DevopsEngineer => 90,
        WorkerType::CodeReviewer => 30,
        WorkerType::TechnicalWriter => 30,
        WorkerType::GeneralPurpose => 60,
    }
}

fn is_developer(worker_type: WorkerType) -> bool {
    matches!(
        worker_type,
        WorkerType::BackendDeveloper
            | WorkerType::FrontendDeveloper
            | WorkerType::MobileDeveloper
            | WorkerType::DataEngineer
            | WorkerType::DevopsEngineer
            | WorkerType::GeneralPurpose
    )
}

/// Worker added to a team of one so a chain has at least two members.
fn complement(worker_type: WorkerType) -> WorkerType {
    if is_developer(worker_type) {
        WorkerType::QaEngineer
    } else if worker_type == WorkerType::QaEngineer {
        WorkerType::BackendDeveloper
    } else if worker_type == WorkerType::CodeReviewer {
        WorkerType::QaEngineer
    } else {
        WorkerType::CodeReviewer
    }
}

/// Turns a [`ComplexityAnalysis`] into a [`TaskGraph`].
pub struct WorkflowPlanner {
    registry: Arc<CapabilityRegistry>,
    thresholds: Thresholds,
    templates: Vec<WorkflowTemplate>,
}

impl WorkflowPlanner {
    /// Planner with the built-in templates.
    pub fn new(registry: Arc<CapabilityRegistry>, thresholds: Thresholds) -> Self {
        Self {
            registry,
            thresholds,
            templates: templates::builtin_templates(),
        }
    }

    /// Replace the template set.
    pub fn with_templates(mut self, templates: Vec<WorkflowTemplate>) -> Self {
        self.templates = templates;
        self
    }

    /// Current strategy cut-offs.
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Templates tried for complex tasks, in order.
    pub fn templates(&self) -> &[WorkflowTemplate] {
        &self.templates
    }

    /// Registry plans are validated against.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Build the graph for `description`.
    ///
    /// The result is validated structurally and against the registry, so
    /// an unknown worker type surfaces here rather than during execution.
    pub fn plan(&self, description: &str, analysis: &ComplexityAnalysis) -> EnsembleResult<TaskGraph> {
        let mut team = analysis.suggested_workers.clone();
        if team.is_empty() {
            team.push(WorkerType::GeneralPurpose);
        }

        let t = self.thresholds;
        let graph = if analysis.score <= t.simple {
            self.single(description, analysis, team[0])
        } else if analysis.score <= t.moderate {
            self.linear(description, analysis, &team)?
        } else if analysis.score <= t.complex {
            self.template(description, analysis)?
        } else {
            self.dynamic(description, analysis)?
        };

        graph.validate()?;
        graph.validate_workers(&self.registry)?;

        info!(
            strategy = %graph.strategy,
            score = analysis.score,
            domain = %analysis.domain,
            nodes = graph.len(),
            phases = graph.phase_count(),
            "Plan selected"
        );
        Ok(graph)
    }

    fn task_for(&self, text: String, worker_type: WorkerType, analysis: &ComplexityAnalysis) -> Task {
        let capabilities: Vec<Capability> = match self.registry.describe(worker_type) {
            Some(d) => analysis
                .required_capabilities
                .iter()
                .copied()
                .filter(|c| d.has(*c))
                .collect(),
            None => Vec::new(),
        };
        Task::new(text).with_capabilities(capabilities)
    }

    fn single(&self, description: &str, analysis: &ComplexityAnalysis, worker: WorkerType) -> TaskGraph {
        let mut graph = TaskGraph::new(PlanStrategy::Single);
        let node = TaskNode::new(
            worker.as_str(),
            self.task_for(description.to_string(), worker, analysis),
            worker,
            0,
        )
        .with_stage("task")
        .with_base_minutes(base_minutes(worker));
        graph.add_node(node);
        graph
    }

    fn linear(&self, description: &str, analysis: &ComplexityAnalysis, team: &[WorkerType]) -> EnsembleResult<TaskGraph> {
        let mut chain: Vec<WorkerType> = team.iter().copied().take(3).collect();
        if chain.len() == 1 {
            chain.push(complement(chain[0]));
        }

        let mut graph = TaskGraph::new(PlanStrategy::Linear);
        let mut previous: Option<NodeId> = None;
        for (i, worker) in chain.into_iter().enumerate() {
            let phase = u32::try_from(i).unwrap_or(u32::MAX);
            let node = TaskNode::new(
                worker.as_str(),
                self.task_for(description.to_string(), worker, analysis),
                worker,
                phase,
            )
            .with_stage(format!("step-{}", i + 1))
            .with_base_minutes(base_minutes(worker));
            let id = graph.add_node(node);
            if let Some(prev) = previous {
                graph.add_dependency(prev, id)?;
            }
            previous = Some(id);
        }
        Ok(graph)
    }

    fn template(&self, description: &str, analysis: &ComplexityAnalysis) -> EnsembleResult<TaskGraph> {
        let wanted = templates::template_for(analysis);
        let template = self
            .templates
            .iter()
            .find(|t| t.name == wanted)
            .or_else(|| self.templates.iter().find(|t| t.name == templates::FEATURE_DEVELOPMENT))
            .or_else(|| self.templates.first())
            .ok_or_else(|| EnsembleError::Planning("no workflow templates configured".to_string()))?;

        let mut graph = TaskGraph::new(PlanStrategy::Template(template.name.clone()));
        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        for step in &template.steps {
            let text = format!("{}.\n\nTask: {description}", step.summary);
            let node = TaskNode::new(
                step.label.clone(),
                self.task_for(text, step.worker_type, analysis),
                step.worker_type,
                step.phase,
            )
            .with_stage(step.stage.clone())
            .with_base_minutes(step.base_minutes);
            let id = graph.add_node(node);
            for dep in &step.depends_on {
                let dep_id = ids.get(dep.as_str()).copied().ok_or_else(|| {
                    EnsembleError::Planning(format!(
                        "template '{}': step '{}' waits for unknown step '{dep}'",
                        template.name, step.label
                    ))
                })?;
                graph.add_dependency(dep_id, id)?;
            }
            ids.insert(step.label.as_str(), id);
        }
        Ok(graph)
    }

    fn dynamic(&self, description: &str, analysis: &ComplexityAnalysis) -> EnsembleResult<TaskGraph> {
        use WorkerType as W;
        let has = |c: Capability| analysis.requires(c);

        let mut discovery = vec![W::ProductManager];
        if has(Capability::Ux) {
            discovery.push(W::UxDesigner);
        }

        let mut architecture = vec![W::Architect];
        if has(Capability::Security) {
            architecture.push(W::SecuritySpecialist);
        }
        if has(Capability::Data) || has(Capability::Database) {
            architecture.push(W::DataEngineer);
        }

        let mut development = Vec::new();
        let client_side = has(Capability::Frontend) || has(Capability::Ux) || has(Capability::Mobile);
        if !client_side
            || [Capability::Backend, Capability::Api, Capability::Database, Capability::Realtime, Capability::Payments]
                .into_iter()
                .any(has)
        {
            development.push(W::BackendDeveloper);
        }
        if has(Capability::Frontend) || has(Capability::Ux) {
            development.push(W::FrontendDeveloper);
        }
        if has(Capability::Mobile) {
            development.push(W::MobileDeveloper);
        }

        let mut quality = vec![W::QaEngineer];
        if has(Capability::Security) {
            quality.push(W::SecuritySpecialist);
        }

        let mut refinement = Vec::new();
        if has(Capability::Devops) {
            refinement.push(W::DevopsEngineer);
        }
        if has(Capability::Documentation) {
            refinement.push(W::TechnicalWriter);
        }

        let stages: [(&str, &str, Vec<WorkerType>); 6] = [
            ("discovery", "Gather requirements", discovery),
            ("architecture", "Design the system", architecture),
            ("development", "Implement", development),
            ("quality", "Verify", quality),
            ("refinement", "Prepare for release", refinement),
            ("review", "Review the deliverables", vec![W::CodeReviewer]),
        ];

        let mut graph = TaskGraph::new(PlanStrategy::Dynamic);
        let mut previous: Vec<NodeId> = Vec::new();
        let mut phase = 0u32;
        for (stage, summary, workers) in stages {
            if workers.is_empty() {
                continue;
            }
            let mut batch = Vec::with_capacity(workers.len());
            for worker in workers {
                let text = format!("{summary}.\n\nTask: {description}");
                let node = TaskNode::new(worker.as_str(), self.task_for(text, worker, analysis), worker, phase)
                    .with_stage(stage)
                    .with_base_minutes(base_minutes(worker));
                let id = graph.add_node(node);
                for dep in &previous {
                    graph.add_dependency(*dep, id)?;
                }
                batch.push(id);
            }
            previous = batch;
            phase += 1;
        }
        Ok(graph)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Dimensions, Domain, EstimatedEffort};
    use ensemble_security::WorkerDescriptor;

    fn planner() -> WorkflowPlanner {
        WorkflowPlanner::new(Arc::new(CapabilityRegistry::builtin()), Thresholds::default())
    }

    fn analysis(score: u8, domain: Domain, caps: &[Capability], workers: &[WorkerType]) -> ComplexityAnalysis {
        ComplexityAnalysis {
            score,
            dimensions: Dimensions::default(),
            domain,
            required_capabilities: caps.to_vec(),
            suggested_workers: workers.to_vec(),
            estimated_effort: EstimatedEffort::from_score(score),
        }
    }

    #[test]
    fn test_simple_is_single_node() {
        let a = analysis(2, Domain::Development, &[], &[WorkerType::BackendDeveloper, WorkerType::QaEngineer]);
        let graph = planner().plan("fix it", &a).unwrap();
        assert_eq!(graph.strategy, PlanStrategy::Single);
        assert_eq!(graph.len(), 1);
        assert!(graph.edges().is_empty());
        assert_eq!(graph.nodes().next().unwrap().worker_type, WorkerType::BackendDeveloper);
    }

    #[test]
    fn test_empty_suggestions_fall_back_to_general() {
        let a = analysis(1, Domain::General, &[], &[]);
        let graph = planner().plan("something", &a).unwrap();
        assert_eq!(graph.nodes().next().unwrap().worker_type, WorkerType::GeneralPurpose);
    }

    #[test]
    fn test_moderate_chain_injects_complement() {
        let a = analysis(5, Domain::Development, &[], &[WorkerType::BackendDeveloper]);
        let graph = planner().plan("add an endpoint", &a).unwrap();
        assert_eq!(graph.strategy, PlanStrategy::Linear);
        let workers: Vec<_> = graph.nodes().map(|n| n.worker_type).collect();
        assert_eq!(workers, vec![WorkerType::BackendDeveloper, WorkerType::QaEngineer]);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_moderate_chain_caps_at_three() {
        let a = analysis(
            6,
            Domain::Architecture,
            &[],
            &[
                WorkerType::Architect,
                WorkerType::BackendDeveloper,
                WorkerType::FrontendDeveloper,
                WorkerType::QaEngineer,
            ],
        );
        let graph = planner().plan("x", &a).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.phase_count(), 3);
        assert_eq!(graph.max_width(), 1);
        for node in graph.nodes() {
            assert!(node.dependencies.len() <= 1);
        }
    }

    #[test]
    fn test_complex_uses_template() {
        let mut a = analysis(8, Domain::Development, &[Capability::Security], &[WorkerType::BackendDeveloper]);
        a.dimensions.security = 7;
        let graph = planner().plan("harden the api", &a).unwrap();
        assert_eq!(graph.strategy, PlanStrategy::Template("security-review".into()));
        assert_eq!(graph.max_width(), 2);
        let threat = graph.nodes().next().unwrap();
        assert_eq!(threat.context_key(), "architecture/threat-model");
        assert!(threat.task.description.ends_with("Task: harden the api"));
        assert!(threat.task.required_capabilities.contains(&Capability::Security));
    }

    #[test]
    fn test_missing_template_falls_back() {
        let a = analysis(7, Domain::Data, &[], &[WorkerType::DataEngineer]);
        let only_feature: Vec<_> = templates::builtin_templates()
            .into_iter()
            .filter(|t| t.name == templates::FEATURE_DEVELOPMENT)
            .collect();
        let graph = planner().with_templates(only_feature).plan("x", &a).unwrap();
        assert_eq!(graph.strategy, PlanStrategy::Template("feature-development".into()));

        let err = planner().with_templates(vec![]).plan("x", &a).unwrap_err();
        assert!(matches!(err, EnsembleError::Planning(_)));
    }

    #[test]
    fn test_extreme_builds_phases() {
        let a = analysis(
            10,
            Domain::Architecture,
            &[Capability::Security, Capability::Mobile, Capability::Realtime, Capability::Documentation],
            &[WorkerType::Architect],
        );
        let graph = planner().plan("everything", &a).unwrap();
        assert_eq!(graph.strategy, PlanStrategy::Dynamic);
        let stages: Vec<String> = graph
            .phases()
            .iter()
            .map(|(_, ids)| graph.node(ids[0]).unwrap().stage.clone())
            .collect();
        assert_eq!(
            stages,
            vec!["discovery", "architecture", "development", "quality", "refinement", "review"]
        );

        // Siblings never depend on each other; each depends on the whole previous batch.
        let phases = graph.phases();
        for window in phases.windows(2) {
            let (_, prev) = &window[0];
            let (_, next) = &window[1];
            for id in next {
                let deps: Vec<NodeId> = graph.node(*id).unwrap().dependencies.iter().copied().collect();
                assert_eq!(&deps, prev);
            }
        }
    }

    #[test]
    fn test_extreme_skips_empty_refinement() {
        let a = analysis(9, Domain::Architecture, &[], &[WorkerType::Architect]);
        let graph = planner().plan("x", &a).unwrap();
        assert_eq!(graph.phase_count(), 5);
    }

    #[test]
    fn test_unknown_worker_type_surfaces_at_planning() {
        let registry = CapabilityRegistry::from_descriptors(vec![WorkerDescriptor::new(
            WorkerType::BackendDeveloper,
            &[Capability::Backend],
        )])
        .unwrap();
        let planner = WorkflowPlanner::new(Arc::new(registry), Thresholds::default());
        let a = analysis(5, Domain::Development, &[], &[WorkerType::BackendDeveloper]);
        let err = planner.plan("x", &a).unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownWorkerType(name) if name == "qa_engineer"));
    }

    #[test]
    fn test_thresholds_validation() {
        Thresholds::default().validate().unwrap();
        let bad = Thresholds {
            simple: 5,
            moderate: 4,
            complex: 8,
        };
        assert!(bad.validate().is_err());
    }
}
