use crate::types::{ComplexityAnalysis, Dimensions, Domain, EstimatedEffort};
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_security::{Capability, CapabilityRegistry, WorkerType};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Scores a task description across the five complexity dimensions.
///
/// Implementations must be deterministic for identical input.
pub trait Classifier: Send + Sync {
    fn score(&self, text: &str) -> Dimensions;
}

type Table = &'static [(&'static str, u8)];

const TECHNICAL: Table = &[
    (r"real-?time|websocket|streaming", 3),
    (r"distributed|microservices?|cluster", 3),
    (r"platform|ecosystem|infrastructure", 2),
    (r"\b(ml|ai|machine learning|neural|llm)\b", 3),
    (r"\bscal(e|able|ability|ing)\b|performance", 2),
    (r"\b(build|develop|implement|create|design)\b", 1),
    (r"architect", 2),
    (r"algorithm|engine|compiler", 2),
];

const INTEGRATION: Table = &[
    (r"payments?|billing|stripe|paypal|checkout", 3),
    (r"\bapis?\b|\brest\b|graphql|grpc", 2),
    (r"third-?party|integrat", 2),
    (r"mobile|\bios\b|android", 3),
    (r"oauth|\bsso\b|saml", 2),
    (r"webhooks?|\bqueues?\b|kafka", 2),
    (r"database|\bsql\b", 1),
];

const SECURITY: Table = &[
    (r"secur(e|ity)", 4),
    (r"\bauth|login|password", 3),
    (r"payments?|financial|banking|\bpci\b", 3),
    (r"encrypt|crypto|\btls\b|\bssl\b", 3),
    (r"compliance|gdpr|hipaa|soc ?2", 3),
    (r"vulnerab|penetration|threat|audit", 3),
];

const COORDINATION: Table = &[
    (r"platform|system|ecosystem", 2),
    (r"\bapps\b|applications|multiple|several|\bmulti", 3),
    (r"frontend|backend|full-?stack", 2),
    (r"\band\b|\bwith\b", 1),
    (r"chat|messaging|notifications?", 2),
    (r"\bteams?\b|stakeholders|cross-functional", 2),
    (r"microservices?|\bservices\b", 2),
];

const TIMELINE: Table = &[
    (r"urgent|asap|immediately|deadline|tomorrow", 4),
    (r"production|launch|go-live|release", 2),
    (r"\bmvp\b|prototype|\bpoc\b", 1),
];

/// First match wins, in this order.
const DOMAINS: &[(Domain, &str)] = &[
    (Domain::Architecture, r"architect|system design|microservices?|scalab|distributed|platform"),
    (Domain::Development, r"\b(implement|develop|code|coding|fix|bug|refactor|feature|endpoint|function)"),
    (Domain::Ux, r"\bux\b|\bui\b|user experience|usability|wireframe|redesign"),
    (Domain::Testing, r"\btest|\bqa\b|quality assurance|coverage"),
    (Domain::Security, r"secur|vulnerab|penetration|threat model|audit"),
    (Domain::Product, r"requirement|roadmap|\bproduct\b|user stor|\bspec"),
    (Domain::Data, r"\bdata\b|\betl\b|analytics|warehouse|pipeline"),
    (Domain::Devops, r"deploy|ci/cd|docker|kubernetes|\bk8s\b|devops|terraform"),
];

const CAPABILITIES: &[(Capability, &str)] = &[
    (Capability::Architecture, r"architect|system design|microservices?|distributed|platform|scalab"),
    (Capability::Backend, r"backend|back-end|server|real-?time|websocket|\bapis?\b"),
    (Capability::Frontend, r"frontend|front-end|web app|dashboard|\bui\b|react"),
    (Capability::Mobile, r"mobile|\bios\b|android"),
    (Capability::Api, r"\bapis?\b|\brest\b|graphql|grpc|endpoint"),
    (Capability::Database, r"database|\bsql\b|postgres|schema|storage"),
    (Capability::Security, r"secur|\bauth|encrypt|vulnerab|compliance|\bpci\b"),
    (Capability::Testing, r"\btest|\bqa\b|coverage"),
    (Capability::Ux, r"\bux\b|user experience|usability|wireframe|design system"),
    (Capability::Devops, r"deploy|ci/cd|docker|kubernetes|infrastructure|devops|monitoring"),
    (Capability::Data, r"\bdata\b|\betl\b|analytics|warehouse"),
    (Capability::Payments, r"payments?|billing|stripe|checkout"),
    (Capability::Realtime, r"real-?time|websocket|streaming|\blive\b"),
    (Capability::Documentation, r"document|readme|\bdocs\b|guide|tutorial"),
    (Capability::Product, r"requirement|roadmap|\bproduct\b|user stor|\bmvp\b"),
    (Capability::Review, r"\breview"),
    (Capability::Orchestration, r"orchestrat|coordinat|multi-agent"),
];

fn compile(pattern: &str) -> EnsembleResult<Regex> {
    Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| EnsembleError::Config(format!("invalid pattern {pattern:?}: {e}")))
}

fn compile_table(table: Table) -> EnsembleResult<Vec<(Regex, u8)>> {
    table.iter().map(|(p, w)| Ok((compile(p)?, *w))).collect()
}

/// Keyword-table classifier. Each indicator adds its weight once when it
/// matches; dimensions are clamped to `0..=10`.
pub struct HeuristicClassifier {
    technical: Vec<(Regex, u8)>,
    integration: Vec<(Regex, u8)>,
    security: Vec<(Regex, u8)>,
    coordination: Vec<(Regex, u8)>,
    timeline: Vec<(Regex, u8)>,
}

impl HeuristicClassifier {
    /// Compile the built-in indicator tables.
    pub fn new() -> EnsembleResult<Self> {
        Ok(Self {
            technical: compile_table(TECHNICAL)?,
            integration: compile_table(INTEGRATION)?,
            security: compile_table(SECURITY)?,
            coordination: compile_table(COORDINATION)?,
            timeline: compile_table(TIMELINE)?,
        })
    }

    fn dimension(base: u8, indicators: &[(Regex, u8)], text: &str) -> u8 {
        let total: u32 = indicators
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, w)| u32::from(*w))
            .sum::<u32>()
            + u32::from(base);
        total.min(10) as u8
    }
}

impl Classifier for HeuristicClassifier {
    fn score(&self, text: &str) -> Dimensions {
        Dimensions {
            technical: Self::dimension(1, &self.technical, text),
            integration: Self::dimension(0, &self.integration, text),
            security: Self::dimension(0, &self.security, text),
            coordination: Self::dimension(0, &self.coordination, text),
            timeline: Self::dimension(1, &self.timeline, text),
        }
    }
}

/// Turns free-form task text into a [`ComplexityAnalysis`].
///
/// Pure: no external calls, and identical input yields identical output.
pub struct ComplexityAnalyzer {
    registry: Arc<CapabilityRegistry>,
    classifier: Box<dyn Classifier>,
    domains: Vec<(Domain, Regex)>,
    capabilities: Vec<(Capability, Regex)>,
}

impl ComplexityAnalyzer {
    /// Analyzer backed by the [`HeuristicClassifier`].
    pub fn new(registry: Arc<CapabilityRegistry>) -> EnsembleResult<Self> {
        Self::with_classifier(registry, Box::new(HeuristicClassifier::new()?))
    }

    /// Analyzer backed by a custom [`Classifier`].
    pub fn with_classifier(registry: Arc<CapabilityRegistry>, classifier: Box<dyn Classifier>) -> EnsembleResult<Self> {
        let domains = DOMAINS
            .iter()
            .map(|(d, p)| Ok((*d, compile(p)?)))
            .collect::<EnsembleResult<Vec<_>>>()?;
        let capabilities = CAPABILITIES
            .iter()
            .map(|(c, p)| Ok((*c, compile(p)?)))
            .collect::<EnsembleResult<Vec<_>>>()?;
        Ok(Self {
            registry,
            classifier,
            domains,
            capabilities,
        })
    }

    /// Registry used to suggest worker types.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Score, classify and staff `text`.
    pub fn analyze(&self, text: &str) -> ComplexityAnalysis {
        let dimensions = self.classifier.score(text);
        let score = dimensions.score();

        let domain = self
            .domains
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map_or(Domain::General, |(d, _)| *d);

        let required_capabilities: Vec<Capability> = self
            .capabilities
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(c, _)| *c)
            .collect();

        let suggested_workers = self.suggest(domain, &required_capabilities);

        debug!(
            score,
            domain = %domain,
            capabilities = required_capabilities.len(),
            workers = suggested_workers.len(),
            "Task analyzed"
        );

        ComplexityAnalysis {
            score,
            dimensions,
            domain,
            required_capabilities,
            suggested_workers,
            estimated_effort: EstimatedEffort::from_score(score),
        }
    }

    fn suggest(&self, domain: Domain, capabilities: &[Capability]) -> Vec<WorkerType> {
        let has = |c: Capability| capabilities.contains(&c);
        let mut workers = Vec::new();

        let primary = match domain {
            Domain::Development if has(Capability::Mobile) && !has(Capability::Backend) => {
                WorkerType::MobileDeveloper
            }
            Domain::Development if has(Capability::Frontend) && !has(Capability::Backend) => {
                WorkerType::FrontendDeveloper
            }
            other => other.primary_worker(),
        };
        workers.push(primary);

        let secondary = [
            (Capability::Security, WorkerType::SecuritySpecialist),
            (Capability::Backend, WorkerType::BackendDeveloper),
            (Capability::Ux, WorkerType::UxDesigner),
            (Capability::Frontend, WorkerType::FrontendDeveloper),
            (Capability::Mobile, WorkerType::MobileDeveloper),
            (Capability::Data, WorkerType::DataEngineer),
            (Capability::Database, WorkerType::DataEngineer),
            (Capability::Devops, WorkerType::DevopsEngineer),
            (Capability::Testing, WorkerType::QaEngineer),
            (Capability::Documentation, WorkerType::TechnicalWriter),
        ];
        for (capability, worker) in secondary {
            if has(capability) {
                workers.push(worker);
            }
        }

        let mut seen = Vec::with_capacity(workers.len());
        for w in workers {
            if !seen.contains(&w) && self.registry.contains(w) {
                seen.push(w);
            }
        }
        seen
    }
}
