use ensemble_security::{Capability, WorkerType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a node, unique within one [`TaskGraph`](crate::TaskGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Status of a task inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Planned, not yet considered for dispatch.
    #[default]
    Pending,
    /// Dependencies satisfied.
    Ready,
    /// Holding a worker.
    Running,
    /// Produced an output.
    Done,
    /// Finished without an output.
    Failed,
    /// Never started because execution halted or was aborted first.
    Skipped,
}

impl TaskStatus {
    /// No further transition will happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

/// A unit of work bound to a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// What the worker is asked to do.
    pub description: String,
    /// Capabilities the assigned worker type must offer.
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    /// Updated by the engine as the node runs.
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// A pending task with no capability requirements.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            status: TaskStatus::Pending,
        }
    }

    /// Replace the required capabilities.
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = capabilities.into_iter().collect();
        self
    }
}

/// Domain a task was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// System design and structure.
    Architecture,
    /// Feature and backend code.
    Development,
    /// Interfaces and user experience.
    Ux,
    /// Test planning and QA.
    Testing,
    /// Threat modeling and hardening.
    Security,
    /// Requirements and scoping.
    Product,
    /// Pipelines, schemas and storage.
    Data,
    /// Deployment and infrastructure.
    Devops,
    /// Nothing more specific matched.
    General,
}

impl Domain {
    /// Lowercase name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Architecture => "architecture",
            Domain::Development => "development",
            Domain::Ux => "ux",
            Domain::Testing => "testing",
            Domain::Security => "security",
            Domain::Product => "product",
            Domain::Data => "data",
            Domain::Devops => "devops",
            Domain::General => "general",
        }
    }

    /// The worker type that leads tasks of this domain.
    pub fn primary_worker(&self) -> WorkerType {
        match self {
            Domain::Architecture => WorkerType::Architect,
            Domain::Development => WorkerType::BackendDeveloper,
            Domain::Ux => WorkerType::UxDesigner,
            Domain::Testing => WorkerType::QaEngineer,
            Domain::Security => WorkerType::SecuritySpecialist,
            Domain::Product => WorkerType::ProductManager,
            Domain::Data => WorkerType::DataEngineer,
            Domain::Devops => WorkerType::DevopsEngineer,
            Domain::General => WorkerType::GeneralPurpose,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse effort bucket derived from the complexity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedEffort {
    /// Under an hour.
    Minutes,
    /// Up to a working day.
    Hours,
    /// Several days.
    Days,
    /// Several weeks.
    Weeks,
    /// A multi-month effort.
    Months,
}

impl EstimatedEffort {
    /// Bucket a `1..=10` complexity score.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=2 => Self::Minutes,
            3..=4 => Self::Hours,
            5..=6 => Self::Days,
            7..=8 => Self::Weeks,
            _ => Self::Months,
        }
    }
}

/// Per-dimension complexity, each in `0..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    /// Algorithmic and architectural difficulty.
    pub technical: u8,
    /// External systems and APIs involved.
    pub integration: u8,
    /// Sensitivity of data and threat surface.
    pub security: u8,
    /// How many specialists must work together.
    pub coordination: u8,
    /// Urgency.
    pub timeline: u8,
}

impl Dimensions {
    /// Weighted combination, rounded and clamped to `1..=10`.
    pub fn score(&self) -> u8 {
        let weighted = f64::from(self.technical) * 0.35
            + f64::from(self.integration) * 0.30
            + f64::from(self.security) * 0.30
            + f64::from(self.coordination) * 0.35
            + f64::from(self.timeline) * 0.10;
        // Bounded by 13.0, so the cast cannot truncate.
        (weighted.round() as u8).clamp(1, 10)
    }
}

/// Result of analyzing a task description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    /// Overall complexity in `1..=10`.
    pub score: u8,
    /// Breakdown behind [`score`](Self::score).
    pub dimensions: Dimensions,
    /// Domain whose primary worker leads the plan.
    pub domain: Domain,
    /// Capabilities matched in the description, in registry order.
    pub required_capabilities: Vec<Capability>,
    /// Worker types covering those capabilities, lead first.
    pub suggested_workers: Vec<WorkerType>,
    /// Derived from the score.
    pub estimated_effort: EstimatedEffort,
}

impl ComplexityAnalysis {
    /// Whether `capability` was detected.
    pub fn requires(&self, capability: Capability) -> bool {
        self.required_capabilities.contains(&capability)
    }
}

/// How a graph was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum PlanStrategy {
    /// One node for the domain's primary worker.
    Single,
    /// A short dependency chain.
    Linear,
    /// A named workflow template.
    Template(String),
    /// Phases assembled from the required capabilities.
    Dynamic,
    /// Assembled by hand.
    Custom,
}

impl fmt::Display for PlanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStrategy::Single => f.write_str("single"),
            PlanStrategy::Linear => f.write_str("linear"),
            PlanStrategy::Template(name) => write!(f, "template({name})"),
            PlanStrategy::Dynamic => f.write_str("dynamic"),
            PlanStrategy::Custom => f.write_str("custom"),
        }
    }
}
