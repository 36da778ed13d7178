use thiserror::Error;

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// Top-level error type for the Ensemble workspace.
///
/// The first group of variants are the orchestration error kinds callers are
/// expected to branch on. The remaining variants are infrastructural.
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// The planner could not produce a usable task graph.
    #[error("Planning error: {0}")]
    Planning(String),

    /// A worker type was referenced that the capability registry does not carry.
    #[error("Unknown worker type: {0}")]
    UnknownWorkerType(String),

    /// A spawn request was rejected by the safety manager.
    #[error("Spawn denied: {0}")]
    SafetyDenied(String),

    /// The external execution interface did not answer within its bound.
    #[error("Dispatch timed out after {timeout_ms} ms")]
    DispatchTimeout {
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// The external execution interface returned an error.
    #[error("Dispatch failed: {0}")]
    DispatchFailure(String),

    /// A message that required a response was not answered in time.
    #[error("No response to message {correlation_id} within {timeout_ms} ms")]
    DeliveryTimeout {
        /// Correlation id of the unanswered message.
        correlation_id: uuid::Uuid,
        /// The bound that elapsed.
        timeout_ms: u64,
    },

    /// Concurrent context updates that could not be merged.
    #[error("Context conflict: {0}")]
    ContextConflict(String),

    /// A violation of the worker hierarchy bookkeeping (e.g. dangling children).
    #[error("Safety error: {0}")]
    Safety(String),

    /// A message could not be routed (unknown recipient, closed mailbox).
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// An error related to session lookup, archival or snapshots.
    #[error("Session error: {0}")]
    Session(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the execution engine itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Whether the error is fatal for a workflow run (reported before or instead
    /// of execution) rather than contained to a single node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnsembleError::Planning(_)
                | EnsembleError::UnknownWorkerType(_)
                | EnsembleError::Safety(_)
                | EnsembleError::Config(_)
        )
    }
}
