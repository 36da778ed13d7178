use crate::types::NodeId;
use async_trait::async_trait;
use ensemble_core::{EnsembleResult, WorkerId};
use ensemble_security::{Capability, WorkerType};
use ensemble_session::ContextView;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Everything a worker receives when its node is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Node being executed.
    pub node_id: NodeId,
    /// Node label; the last segment of its context key.
    pub label: String,
    /// Stage name the node belongs to.
    pub stage: String,
    /// Handle approved for this dispatch.
    pub worker_id: WorkerId,
    /// Type of worker the node needs.
    pub worker_type: WorkerType,
    /// The task text.
    pub description: String,
    /// Capabilities the task asks for.
    pub required_capabilities: BTreeSet<Capability>,
    /// Tools the worker type is permitted to use.
    pub tools: Vec<String>,
    /// Session context as visible to this worker.
    pub context: ContextView,
    /// Outputs of dependencies that succeeded, keyed by their context key.
    pub dependency_outputs: BTreeMap<String, String>,
}

/// The external execution interface.
///
/// Implementations call out to whatever service does the actual work. The
/// engine bounds each call with a timeout and treats any error as a failed
/// node.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> EnsembleResult<String>;
}
