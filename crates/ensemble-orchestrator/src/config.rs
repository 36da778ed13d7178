use crate::engine::ExecutionOptions;
use crate::planner::Thresholds;
use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_security::{CapabilityRegistry, SafetyLimits, WorkerDescriptor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level orchestrator configuration, usually read from `ensemble.toml`.
///
/// Every section can be omitted and falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// `[thresholds]`: score cut-offs between plan strategies.
    pub thresholds: Thresholds,
    /// `[safety]`, including `[safety.nested]`.
    pub safety: SafetyLimits,
    /// `[execution]`.
    pub execution: ExecutionSettings,
    /// `[messaging]`.
    pub messaging: MessagingSettings,
    /// Registry source; the built-in catalog is used when empty.
    pub workers: Vec<WorkerDescriptor>,
}

/// `[execution]` section; see [`ExecutionOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Bound on one dispatch call.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Introduce workers through handoffs instead of plain joins.
    #[serde(default = "default_true")]
    pub handoff_between_phases: bool,
    /// Archive the session when a run ends.
    #[serde(default)]
    pub archive_on_finish: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            handoff_between_phases: true,
            archive_on_finish: false,
        }
    }
}

/// `[messaging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingSettings {
    /// How long a request waits for its response.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_dispatch_timeout_ms() -> u64 {
    300_000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Read and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> EnsembleResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            EnsembleError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> EnsembleResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| EnsembleError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, including the worker catalog.
    pub fn validate(&self) -> EnsembleResult<()> {
        self.thresholds.validate()?;
        self.safety.validate()?;
        if self.execution.dispatch_timeout_ms == 0 {
            return Err(EnsembleError::Config(
                "execution.dispatch_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.messaging.response_timeout_ms == 0 {
            return Err(EnsembleError::Config(
                "messaging.response_timeout_ms must be non-zero".to_string(),
            ));
        }
        self.registry().map(|_| ())
    }

    /// The capability registry this config describes.
    pub fn registry(&self) -> EnsembleResult<CapabilityRegistry> {
        if self.workers.is_empty() {
            Ok(CapabilityRegistry::builtin())
        } else {
            CapabilityRegistry::from_descriptors(self.workers.clone())
        }
    }

    /// Engine options described by `[execution]`.
    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            dispatch_timeout: Duration::from_millis(self.execution.dispatch_timeout_ms),
            handoff_between_phases: self.execution.handoff_between_phases,
            archive_on_finish: self.execution.archive_on_finish,
        }
    }

    /// Messenger request timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.messaging.response_timeout_ms)
    }
}
