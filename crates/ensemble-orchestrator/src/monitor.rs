use ensemble_security::WorkerType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one worker type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Dispatches started.
    pub dispatched: u32,
    /// Dispatches that produced an output.
    pub succeeded: u32,
    /// Dispatches that ended without one.
    pub failed: u32,
    /// Dispatches currently in flight.
    pub active: u32,
    /// Summed wall time of finished dispatches.
    pub duration_ms: u64,
}

/// Tracks dispatch metrics per worker type across runs.
pub struct WorkerMonitor {
    metrics: Arc<RwLock<HashMap<WorkerType, WorkerMetrics>>>,
}

impl WorkerMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A dispatch for `worker_type` has started.
    pub async fn start(&self, worker_type: WorkerType) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(worker_type).or_default();
        entry.dispatched += 1;
        entry.active += 1;
    }

    /// A dispatch for `worker_type` has ended.
    pub async fn finish(&self, worker_type: WorkerType, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(worker_type).or_default();
        entry.active = entry.active.saturating_sub(1);
        entry.duration_ms += duration_ms;
        if success {
            entry.succeeded += 1;
        } else {
            entry.failed += 1;
        }
    }

    /// Metrics for one worker type, if it was ever dispatched.
    pub async fn get(&self, worker_type: WorkerType) -> Option<WorkerMetrics> {
        self.metrics.read().await.get(&worker_type).cloned()
    }

    /// Metrics of every worker type seen so far, ordered by type.
    pub async fn snapshot(&self) -> Vec<(WorkerType, WorkerMetrics)> {
        let metrics = self.metrics.read().await;
        let mut all: Vec<_> = metrics.iter().map(|(k, v)| (*k, v.clone())).collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }

    /// Totals across every worker type.
    pub async fn aggregate(&self) -> WorkerMetrics {
        let metrics = self.metrics.read().await;
        let mut total = WorkerMetrics::default();
        for m in metrics.values() {
            total.dispatched += m.dispatched;
            total.succeeded += m.succeeded;
            total.failed += m.failed;
            total.active += m.active;
            total.duration_ms += m.duration_ms;
        }
        total
    }

    /// JSON report with per-type metrics and totals.
    pub async fn to_json(&self) -> serde_json::Value {
        let workers: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .await
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::to_value(v).unwrap_or_default()))
            .collect();
        serde_json::json!({
            "workers": workers,
            "aggregate": self.aggregate().await,
        })
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
