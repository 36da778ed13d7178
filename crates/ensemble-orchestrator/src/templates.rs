use crate::types::{ComplexityAnalysis, Domain};
use ensemble_security::WorkerType;
use serde::{Deserialize, Serialize};

/// One step of a canned workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStep {
    /// Unique within the template.
    pub label: String,
    /// Stage name, the first part of the context key.
    pub stage: String,
    /// Steps sharing a phase run concurrently.
    pub phase: u32,
    /// Who performs the step.
    pub worker_type: WorkerType,
    /// What the worker is asked to do; the task text is appended.
    pub summary: String,
    /// Labels of steps this one waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Unscaled duration estimate.
    pub base_minutes: u32,
}

/// A fixed graph shape instantiated for mid-complexity tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Name used in `PlanStrategy::Template`.
    pub name: String,
    /// What the workflow is for.
    pub description: String,
    /// Steps in phase order.
    pub steps: Vec<TemplateStep>,
}

/// Requirements through review, with parallel backend and frontend.
pub const FEATURE_DEVELOPMENT: &str = "feature-development";
/// Threat model, hardening, penetration testing and sign-off.
pub const SECURITY_REVIEW: &str = "security-review";
/// Source profiling, pipeline and validation.
pub const DATA_PIPELINE: &str = "data-pipeline";
/// Topology, provisioning and runbook.
pub const INFRASTRUCTURE_ROLLOUT: &str = "infrastructure-rollout";
/// Research, implementation and usability testing.
pub const UX_REDESIGN: &str = "ux-redesign";

/// Pick the template name for `analysis`.
pub fn template_for(analysis: &ComplexityAnalysis) -> &'static str {
    if analysis.dimensions.security >= 6 || analysis.domain == Domain::Security {
        return SECURITY_REVIEW;
    }
    match analysis.domain {
        Domain::Data => DATA_PIPELINE,
        Domain::Devops => INFRASTRUCTURE_ROLLOUT,
        Domain::Ux => UX_REDESIGN,
        _ => FEATURE_DEVELOPMENT,
    }
}

/// The built-in template set.
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        feature_development(),
        security_review(),
        data_pipeline(),
        infrastructure_rollout(),
        ux_redesign(),
    ]
}

fn step(
    label: &str,
    stage: &str,
    phase: u32,
    worker_type: WorkerType,
    summary: &str,
    depends_on: &[&str],
    base_minutes: u32,
) -> TemplateStep {
    TemplateStep {
        label: label.to_string(),
        stage: stage.to_string(),
        phase,
        worker_type,
        summary: summary.to_string(),
        depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
        base_minutes,
    }
}

fn feature_development() -> WorkflowTemplate {
    use WorkerType as W;
    WorkflowTemplate {
        name: FEATURE_DEVELOPMENT.to_string(),
        description: "Requirements, design, parallel implementation, verification and review".to_string(),
        steps: vec![
            step("requirements", "discovery", 0, W::ProductManager, "Clarify requirements and acceptance criteria", &[], 30),
            step("design", "architecture", 1, W::Architect, "Design the components and interfaces", &["requirements"], 45),
            step("backend", "development", 2, W::BackendDeveloper, "Implement the server side", &["design"], 120),
            step("frontend", "development", 2, W::FrontendDeveloper, "Implement the user interface", &["design"], 120),
            step("verification", "quality", 3, W::QaEngineer, "Test the feature end to end", &["backend", "frontend"], 60),
            step("review", "review", 4, W::CodeReviewer, "Review the change set", &["verification"], 30),
        ],
    }
}

fn security_review() -> WorkflowTemplate {
    use WorkerType as W;
    WorkflowTemplate {
        name: SECURITY_REVIEW.to_string(),
        description: "Threat model, hardening, parallel verification and sign-off".to_string(),
        steps: vec![
            step("threat-model", "architecture", 0, W::SecuritySpecialist, "Build a threat model and list the controls required", &[], 60),
            step("hardening", "development", 1, W::BackendDeveloper, "Implement the required controls", &["threat-model"], 90),
            step("regression", "quality", 2, W::QaEngineer, "Run functional and regression tests", &["hardening"], 45),
            step("penetration", "quality", 2, W::SecuritySpecialist, "Attempt to bypass the controls", &["hardening"], 60),
            step("sign-off", "review", 3, W::CodeReviewer, "Review findings and approve", &["regression", "penetration"], 30),
        ],
    }
}

fn data_pipeline() -> WorkflowTemplate {
    use WorkerType as W;
    WorkflowTemplate {
        name: DATA_PIPELINE.to_string(),
        description: "Source analysis, pipeline and integration, validation and review".to_string(),
        steps: vec![
            step("sources", "discovery", 0, W::DataEngineer, "Profile the data sources and define the schema", &[], 40),
            step("pipeline", "development", 1, W::DataEngineer, "Build the transformation pipeline", &["sources"], 120),
            step("integration", "development", 1, W::BackendDeveloper, "Expose the results to consumers", &["sources"], 90),
            step("validation", "quality", 2, W::QaEngineer, "Validate data quality and edge cases", &["pipeline", "integration"], 60),
            step("review", "review", 3, W::CodeReviewer, "Review the pipeline", &["validation"], 30),
        ],
    }
}

fn infrastructure_rollout() -> WorkflowTemplate {
    use WorkerType as W;
    WorkflowTemplate {
        name: INFRASTRUCTURE_ROLLOUT.to_string(),
        description: "Topology design, provisioning, hardening checks and runbook".to_string(),
        steps: vec![
            step("topology", "architecture", 0, W::Architect, "Design the deployment topology", &[], 45),
            step("provisioning", "development", 1, W::DevopsEngineer, "Provision and automate the environment", &["topology"], 120),
            step("hardening", "quality", 2, W::SecuritySpecialist, "Check the environment configuration", &["provisioning"], 45),
            step("smoke-tests", "quality", 2, W::QaEngineer, "Run smoke tests against the environment", &["provisioning"], 45),
            step("runbook", "refinement", 3, W::TechnicalWriter, "Write the operations runbook", &["hardening", "smoke-tests"], 30),
        ],
    }
}

fn ux_redesign() -> WorkflowTemplate {
    use WorkerType as W;
    WorkflowTemplate {
        name: UX_REDESIGN.to_string(),
        description: "Research, implementation, usability testing and review".to_string(),
        steps: vec![
            step("research", "discovery", 0, W::UxDesigner, "Research users and produce wireframes", &[], 60),
            step("goals", "discovery", 0, W::ProductManager, "State the product goals of the redesign", &[], 30),
            step("implementation", "development", 1, W::FrontendDeveloper, "Implement the redesigned screens", &["research", "goals"], 120),
            step("usability", "quality", 2, W::QaEngineer, "Run usability and regression checks", &["implementation"], 45),
            step("review", "review", 3, W::CodeReviewer, "Review the implementation", &["usability"], 30),
        ],
    }
}
