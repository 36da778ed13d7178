use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// A capability a worker can bring to a task.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Architecture,
    Backend,
    Frontend,
    Mobile,
    Api,
    Database,
    Security,
    Testing,
    Ux,
    Devops,
    Data,
    Payments,
    Realtime,
    Documentation,
    Product,
    Review,
    Orchestration,
    General,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Architecture => "architecture",
            Capability::Backend => "backend",
            Capability::Frontend => "frontend",
            Capability::Mobile => "mobile",
            Capability::Api => "api",
            Capability::Database => "database",
            Capability::Security => "security",
            Capability::Testing => "testing",
            Capability::Ux => "ux",
            Capability::Devops => "devops",
            Capability::Data => "data",
            Capability::Payments => "payments",
            Capability::Realtime => "realtime",
            Capability::Documentation => "documentation",
            Capability::Product => "product",
            Capability::Review => "review",
            Capability::Orchestration => "orchestration",
            Capability::General => "general",
        };
        f.write_str(name)
    }
}

/// The kind of worker a task node is bound to.
///
/// The variant only selects capability metadata; dispatch is uniform for all
/// worker types.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Orchestrator,
    ProductManager,
    Architect,
    BackendDeveloper,
    FrontendDeveloper,
    MobileDeveloper,
    UxDesigner,
    QaEngineer,
    SecuritySpecialist,
    DataEngineer,
    DevopsEngineer,
    CodeReviewer,
    TechnicalWriter,
    GeneralPurpose,
}

impl WorkerType {
    /// Every worker type, in catalog order.
    pub const ALL: [WorkerType; 14] = [
        WorkerType::Orchestrator,
        WorkerType::ProductManager,
        WorkerType::Architect,
        WorkerType::BackendDeveloper,
        WorkerType::FrontendDeveloper,
        WorkerType::MobileDeveloper,
        WorkerType::UxDesigner,
        WorkerType::QaEngineer,
        WorkerType::SecuritySpecialist,
        WorkerType::DataEngineer,
        WorkerType::DevopsEngineer,
        WorkerType::CodeReviewer,
        WorkerType::TechnicalWriter,
        WorkerType::GeneralPurpose,
    ];

    /// Stable snake_case name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Orchestrator => "orchestrator",
            WorkerType::ProductManager => "product_manager",
            WorkerType::Architect => "architect",
            WorkerType::BackendDeveloper => "backend_developer",
            WorkerType::FrontendDeveloper => "frontend_developer",
            WorkerType::MobileDeveloper => "mobile_developer",
            WorkerType::UxDesigner => "ux_designer",
            WorkerType::QaEngineer => "qa_engineer",
            WorkerType::SecuritySpecialist => "security_specialist",
            WorkerType::DataEngineer => "data_engineer",
            WorkerType::DevopsEngineer => "devops_engineer",
            WorkerType::CodeReviewer => "code_reviewer",
            WorkerType::TechnicalWriter => "technical_writer",
            WorkerType::GeneralPurpose => "general_purpose",
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        WorkerType::ALL
            .iter()
            .copied()
            .find(|w| w.as_str() == normalized)
            .ok_or_else(|| EnsembleError::UnknownWorkerType(s.to_string()))
    }
}

/// Whether a worker follows a canned plan or adapts its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    #[default]
    Fixed,
    Adaptive,
}

/// Static metadata for one worker type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub worker_type: WorkerType,
    pub capabilities: BTreeSet<Capability>,
    /// Tool names the worker is permitted to use.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub default_mode: OrchestrationMode,
    /// Multiplier applied to step base durations when estimating a plan.
    #[serde(default = "default_multiplier")]
    pub complexity_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl WorkerDescriptor {
    pub fn new(worker_type: WorkerType, capabilities: &[Capability]) -> Self {
        Self {
            worker_type,
            capabilities: capabilities.iter().copied().collect(),
            tools: Vec::new(),
            default_mode: OrchestrationMode::Fixed,
            complexity_multiplier: default_multiplier(),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn with_mode(mut self, mode: OrchestrationMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.complexity_multiplier = multiplier;
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Read-only catalog of worker types.
///
/// Built once at startup; there is no runtime mutation.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    descriptors: Vec<WorkerDescriptor>,
}

impl CapabilityRegistry {
    /// Build a registry from explicit descriptors (e.g. a config file).
    ///
    /// Fails if a worker type is listed twice.
    pub fn from_descriptors(descriptors: Vec<WorkerDescriptor>) -> EnsembleResult<Self> {
        let mut seen = BTreeSet::new();
        for d in &descriptors {
            if !seen.insert(d.worker_type) {
                return Err(EnsembleError::Config(format!(
                    "worker type '{}' is declared more than once",
                    d.worker_type
                )));
            }
            if d.complexity_multiplier.is_nan() || d.complexity_multiplier <= 0.0 {
                return Err(EnsembleError::Config(format!(
                    "worker type '{}' has a non-positive complexity multiplier",
                    d.worker_type
                )));
            }
        }
        Ok(Self { descriptors })
    }

    /// The built-in catalog covering every [`WorkerType`].
    pub fn builtin() -> Self {
        use Capability as C;
        use OrchestrationMode::{Adaptive, Fixed};
        use WorkerType as W;

        const READ: &[&str] = &["read", "grep", "glob"];
        const EDIT: &[&str] = &["read", "grep", "glob", "write", "edit"];
        const FULL: &[&str] = &["read", "grep", "glob", "write", "edit", "bash"];

        let descriptors = vec![
            WorkerDescriptor::new(W::Orchestrator, &[C::Orchestration, C::Architecture, C::Product])
                .with_tools(&["task", "read", "grep"])
                .with_mode(Adaptive)
                .with_multiplier(1.2),
            WorkerDescriptor::new(W::ProductManager, &[C::Product, C::Documentation])
                .with_tools(READ)
                .with_mode(Fixed)
                .with_multiplier(0.8),
            WorkerDescriptor::new(W::Architect, &[C::Architecture, C::Backend, C::Api, C::Database, C::Realtime])
                .with_tools(READ)
                .with_mode(Adaptive)
                .with_multiplier(1.3),
            WorkerDescriptor::new(W::BackendDeveloper, &[C::Backend, C::Api, C::Database, C::Payments, C::Realtime])
                .with_tools(FULL)
                .with_multiplier(1.5),
            WorkerDescriptor::new(W::FrontendDeveloper, &[C::Frontend, C::Ux, C::Api])
                .with_tools(FULL)
                .with_multiplier(1.4),
            WorkerDescriptor::new(W::MobileDeveloper, &[C::Mobile, C::Frontend, C::Api])
                .with_tools(FULL)
                .with_multiplier(1.6),
            WorkerDescriptor::new(W::UxDesigner, &[C::Ux, C::Frontend, C::Product])
                .with_tools(EDIT)
                .with_multiplier(1.0),
            WorkerDescriptor::new(W::QaEngineer, &[C::Testing, C::Review])
                .with_tools(FULL)
                .with_multiplier(1.1),
            WorkerDescriptor::new(W::SecuritySpecialist, &[C::Security, C::Review, C::Payments])
                .with_tools(&["read", "grep", "glob", "bash"])
                .with_mode(Adaptive)
                .with_multiplier(1.4),
            WorkerDescriptor::new(W::DataEngineer, &[C::Data, C::Database, C::Backend])
                .with_tools(FULL)
                .with_multiplier(1.3),
            WorkerDescriptor::new(W::DevopsEngineer, &[C::Devops, C::Realtime])
                .with_tools(FULL)
                .with_multiplier(1.2),
            WorkerDescriptor::new(W::CodeReviewer, &[C::Review, C::Security, C::Testing])
                .with_tools(READ)
                .with_multiplier(0.7),
            WorkerDescriptor::new(W::TechnicalWriter, &[C::Documentation])
                .with_tools(EDIT)
                .with_multiplier(0.6),
            WorkerDescriptor::new(W::GeneralPurpose, &[C::General])
                .with_tools(FULL)
                .with_multiplier(1.0),
        ];

        Self { descriptors }
    }

    /// Metadata for a worker type, if the registry carries it.
    pub fn describe(&self, worker_type: WorkerType) -> Option<&WorkerDescriptor> {
        self.descriptors.iter().find(|d| d.worker_type == worker_type)
    }

    /// Like [`describe`](Self::describe) but an absent type is a configuration error.
    pub fn require(&self, worker_type: WorkerType) -> EnsembleResult<&WorkerDescriptor> {
        self.describe(worker_type)
            .ok_or_else(|| EnsembleError::UnknownWorkerType(worker_type.to_string()))
    }

    pub fn contains(&self, worker_type: WorkerType) -> bool {
        self.describe(worker_type).is_some()
    }

    /// Worker types declaring `capability`, in registry order.
    pub fn find_by_capability(&self, capability: Capability) -> Vec<WorkerType> {
        self.descriptors
            .iter()
            .filter(|d| d.has(capability))
            .map(|d| d.worker_type)
            .collect()
    }

    pub fn worker_types(&self) -> impl Iterator<Item = WorkerType> + '_ {
        self.descriptors.iter().map(|d| d.worker_type)
    }

    pub fn descriptors(&self) -> &[WorkerDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_worker_type() {
        let registry = CapabilityRegistry::builtin();
        assert_eq!(registry.len(), WorkerType::ALL.len());
        for w in WorkerType::ALL {
            assert!(registry.contains(w), "missing {w}");
        }
    }

    #[test]
    fn test_find_by_capability_in_registry_order() {
        let registry = CapabilityRegistry::builtin();
        let security = registry.find_by_capability(Capability::Security);
        assert_eq!(
            security,
            vec![WorkerType::SecuritySpecialist, WorkerType::CodeReviewer]
        );
        assert_eq!(
            registry.find_by_capability(Capability::General),
            vec![WorkerType::GeneralPurpose]
        );
    }

    #[test]
    fn test_describe_reports_mode_and_tools() {
        let registry = CapabilityRegistry::builtin();
        let architect = registry.describe(WorkerType::Architect).unwrap();
        assert_eq!(architect.default_mode, OrchestrationMode::Adaptive);
        assert!(architect.tools.contains(&"read".to_string()));
        assert!(!architect.tools.contains(&"bash".to_string()));
    }

    #[test]
    fn test_require_unknown_type_is_error() {
        let registry = CapabilityRegistry::from_descriptors(vec![WorkerDescriptor::new(
            WorkerType::GeneralPurpose,
            &[Capability::General],
        )])
        .unwrap();
        let err = registry.require(WorkerType::Architect).unwrap_err();
        assert!(matches!(err, EnsembleError::UnknownWorkerType(_)));
    }

    #[test]
    fn test_duplicate_descriptors_rejected() {
        let d = WorkerDescriptor::new(WorkerType::Architect, &[Capability::Architecture]);
        let err = CapabilityRegistry::from_descriptors(vec![d.clone(), d]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_worker_type_parse() {
        assert_eq!(
            "security-specialist".parse::<WorkerType>().unwrap(),
            WorkerType::SecuritySpecialist
        );
        assert_eq!(
            "QA_ENGINEER".parse::<WorkerType>().unwrap(),
            WorkerType::QaEngineer
        );
        assert!("wizard".parse::<WorkerType>().is_err());
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let json = r#"{"worker_type":"tester_missing","capabilities":[]}"#;
        assert!(serde_json::from_str::<WorkerDescriptor>(json).is_err());

        let json = r#"{"worker_type":"qa_engineer","capabilities":["testing"]}"#;
        let d: WorkerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.default_mode, OrchestrationMode::Fixed);
        assert!((d.complexity_multiplier - 1.0).abs() < f64::EPSILON);
        assert!(d.tools.is_empty());
    }
}
