use crate::capability::WorkerType;
use crate::rate_limit::SpawnRateLimiter;
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which worker types a spawn request may ask for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "AllowedWorkersRepr", into = "AllowedWorkersRepr")]
pub enum AllowedWorkers {
    #[default]
    All,
    Only(BTreeSet<WorkerType>),
}

impl AllowedWorkers {
    pub fn only(types: impl IntoIterator<Item = WorkerType>) -> Self {
        AllowedWorkers::Only(types.into_iter().collect())
    }

    pub fn permits(&self, worker_type: WorkerType) -> bool {
        match self {
            AllowedWorkers::All => true,
            AllowedWorkers::Only(set) => set.contains(&worker_type),
        }
    }
}

/// Config form: either the keyword `"all"` or a list of worker type names.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AllowedWorkersRepr {
    Keyword(String),
    List(Vec<WorkerType>),
}

impl TryFrom<AllowedWorkersRepr> for AllowedWorkers {
    type Error = String;

    fn try_from(repr: AllowedWorkersRepr) -> Result<Self, Self::Error> {
        match repr {
            AllowedWorkersRepr::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(AllowedWorkers::All),
            AllowedWorkersRepr::Keyword(k) => Err(format!(
                "expected \"all\" or a list of worker types, got \"{k}\""
            )),
            AllowedWorkersRepr::List(list) => Ok(AllowedWorkers::only(list)),
        }
    }
}

impl From<AllowedWorkers> for AllowedWorkersRepr {
    fn from(allowed: AllowedWorkers) -> Self {
        match allowed {
            AllowedWorkers::All => AllowedWorkersRepr::Keyword("all".to_string()),
            AllowedWorkers::Only(set) => AllowedWorkersRepr::List(set.into_iter().collect()),
        }
    }
}

/// Budget granted to a nested meta-orchestrator for its own children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedBudget {
    /// Spawns one nested parent may perform over its whole lifetime.
    pub max_children: usize,
    /// Types a nested parent may spawn.
    pub allowed_worker_types: AllowedWorkers,
}

impl Default for NestedBudget {
    fn default() -> Self {
        Self {
            max_children: 5,
            allowed_worker_types: AllowedWorkers::All,
        }
    }
}

/// Global bounds enforced on every spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_total_workers: usize,
    /// Deepest permitted hierarchy level; root workers sit at depth 0.
    pub max_depth: u32,
    pub rate_window_ms: u64,
    pub max_spawns_per_window: u32,
    pub allowed_worker_types: AllowedWorkers,
    /// Applied to every nested meta-orchestrator; see [`SafetyManager::limit_children`].
    pub nested: NestedBudget,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_total_workers: 10,
            max_depth: 3,
            rate_window_ms: 60_000,
            max_spawns_per_window: 20,
            allowed_worker_types: AllowedWorkers::All,
            nested: NestedBudget::default(),
        }
    }
}

impl SafetyLimits {
    pub fn with_max_total_workers(mut self, max: usize) -> Self {
        self.max_total_workers = max;
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_rate(mut self, window: Duration, max_spawns: u32) -> Self {
        self.rate_window_ms = window.as_millis() as u64;
        self.max_spawns_per_window = max_spawns;
        self
    }

    pub fn with_allowed(mut self, allowed: AllowedWorkers) -> Self {
        self.allowed_worker_types = allowed;
        self
    }

    /// Set the nested budget.
    pub fn with_nested(mut self, nested: NestedBudget) -> Self {
        self.nested = nested;
        self
    }

    pub fn validate(&self) -> EnsembleResult<()> {
        if self.max_total_workers == 0 {
            return Err(EnsembleError::Config(
                "safety.max_total_workers must be at least 1".to_string(),
            ));
        }
        if self.rate_window_ms == 0 || self.max_spawns_per_window == 0 {
            return Err(EnsembleError::Config(
                "safety rate window and max_spawns_per_window must be non-zero".to_string(),
            ));
        }
        if self.nested.max_children == 0 {
            return Err(EnsembleError::Config(
                "safety.nested.max_children must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Completed,
    Failed,
    /// Removed by a forced teardown.
    TornDown,
}

/// A live worker registered in the hierarchy tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub parent_id: Option<WorkerId>,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

/// Why a spawn request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MaxAgentsReached,
    UnknownParent,
    MaxDepthReached,
    RateLimited,
    TypeNotPermitted,
    /// The parent used up the spawns granted by [`SafetyManager::limit_children`].
    ChildBudgetExhausted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DenyReason::MaxAgentsReached => "max agents reached",
            DenyReason::UnknownParent => "unknown parent",
            DenyReason::MaxDepthReached => "max depth reached",
            DenyReason::RateLimited => "rate limited",
            DenyReason::TypeNotPermitted => "type not permitted for this parent",
            DenyReason::ChildBudgetExhausted => "child budget exhausted",
        };
        f.write_str(text)
    }
}

/// Outcome of [`SafetyManager::request_spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnDecision {
    Approved(WorkerHandle),
    Denied(DenyReason),
}

impl SpawnDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, SpawnDecision::Approved(_))
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        match self {
            SpawnDecision::Approved(h) => Some(h),
            SpawnDecision::Denied(_) => None,
        }
    }

    /// Convert a denial into [`EnsembleError::SafetyDenied`].
    pub fn into_result(self) -> EnsembleResult<WorkerHandle> {
        match self {
            SpawnDecision::Approved(h) => Ok(h),
            SpawnDecision::Denied(reason) => Err(EnsembleError::SafetyDenied(reason.to_string())),
        }
    }
}

/// Counters of decisions taken since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnStats {
    pub approved: u64,
    pub denied: u64,
    pub unregistered: u64,
    pub torn_down: u64,
}

struct Hierarchy {
    workers: HashMap<WorkerId, WorkerHandle>,
    children: HashMap<WorkerId, BTreeSet<WorkerId>>,
    restrictions: HashMap<WorkerId, AllowedWorkers>,
    /// Spawns a limited parent has left.
    budgets: HashMap<WorkerId, usize>,
    limiter: SpawnRateLimiter,
    stats: SpawnStats,
}

impl Hierarchy {
    fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        let handle = self.workers.remove(&id)?;
        self.children.remove(&id);
        self.restrictions.remove(&id);
        self.budgets.remove(&id);
        self.limiter.forget(id);
        if let Some(parent) = handle.parent_id {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&id);
            }
        }
        Some(handle)
    }
}

/// Gatekeeper for every worker spawn.
///
/// Owns the live hierarchy tree. All mutation goes through
/// [`request_spawn`](Self::request_spawn), [`unregister`](Self::unregister) and
/// [`teardown`](Self::teardown), each of which runs under a single lock.
pub struct SafetyManager {
    limits: SafetyLimits,
    state: Mutex<Hierarchy>,
}

impl SafetyManager {
    pub fn new(limits: SafetyLimits) -> Self {
        let limiter = SpawnRateLimiter::new(
            Duration::from_millis(limits.rate_window_ms),
            limits.max_spawns_per_window,
        );
        Self {
            limits,
            state: Mutex::new(Hierarchy {
                workers: HashMap::new(),
                children: HashMap::new(),
                restrictions: HashMap::new(),
                budgets: HashMap::new(),
                limiter,
                stats: SpawnStats::default(),
            }),
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Ask permission to spawn `worker_type` under `parent` (`None` = root).
    ///
    /// Checks, in order: live worker count, hierarchy depth, the parent's spawn
    /// rate, the worker types permitted for this parent, then the parent's
    /// remaining child budget.
    pub fn request_spawn(&self, parent: Option<WorkerId>, worker_type: WorkerType) -> SpawnDecision {
        let now = Instant::now();
        let mut state = self.state.lock();

        let decision = self.evaluate(&mut state, parent, worker_type, now);
        match &decision {
            Ok(depth) => {
                let handle = WorkerHandle {
                    id: WorkerId::new(),
                    worker_type,
                    parent_id: parent,
                    depth: *depth,
                    created_at: Utc::now(),
                    status: WorkerStatus::Active,
                };
                state.workers.insert(handle.id, handle.clone());
                if let Some(p) = parent {
                    state.children.entry(p).or_default().insert(handle.id);
                    if let Some(left) = state.budgets.get_mut(&p) {
                        *left = left.saturating_sub(1);
                    }
                }
                state.limiter.record(parent, now);
                state.stats.approved += 1;
                debug!(
                    worker_id = %handle.id,
                    worker_type = %worker_type,
                    depth = handle.depth,
                    live = state.workers.len(),
                    "Spawn approved"
                );
                SpawnDecision::Approved(handle)
            }
            Err(reason) => {
                state.stats.denied += 1;
                warn!(
                    parent = ?parent,
                    worker_type = %worker_type,
                    reason = %reason,
                    "Spawn denied"
                );
                SpawnDecision::Denied(*reason)
            }
        }
    }

    fn evaluate(
        &self,
        state: &mut Hierarchy,
        parent: Option<WorkerId>,
        worker_type: WorkerType,
        now: Instant,
    ) -> Result<u32, DenyReason> {
        if state.workers.len() >= self.limits.max_total_workers {
            return Err(DenyReason::MaxAgentsReached);
        }

        let depth = match parent {
            Some(p) => state
                .workers
                .get(&p)
                .map(|h| h.depth + 1)
                .ok_or(DenyReason::UnknownParent)?,
            None => 0,
        };
        if depth > self.limits.max_depth {
            return Err(DenyReason::MaxDepthReached);
        }

        if !state.limiter.would_allow(parent, now) {
            return Err(DenyReason::RateLimited);
        }

        let allowed = parent
            .and_then(|p| state.restrictions.get(&p))
            .unwrap_or(&self.limits.allowed_worker_types);
        if !allowed.permits(worker_type) {
            return Err(DenyReason::TypeNotPermitted);
        }

        if parent.and_then(|p| state.budgets.get(&p)) == Some(&0) {
            return Err(DenyReason::ChildBudgetExhausted);
        }

        Ok(depth)
    }

    /// Remove a finished worker from the tree.
    ///
    /// The worker's children must already be unregistered; a dangling child is
    /// reported as [`EnsembleError::Safety`] and nothing is removed.
    pub fn unregister(&self, id: WorkerId, status: WorkerStatus) -> EnsembleResult<WorkerHandle> {
        let mut state = self.state.lock();
        if !state.workers.contains_key(&id) {
            return Err(EnsembleError::Safety(format!("worker {id} is not registered")));
        }
        let live_children = state.children.get(&id).map_or(0, BTreeSet::len);
        if live_children > 0 {
            return Err(EnsembleError::Safety(format!(
                "worker {id} still has {live_children} live children"
            )));
        }

        let mut handle = state
            .remove(id)
            .ok_or_else(|| EnsembleError::Safety(format!("worker {id} is not registered")))?;
        handle.status = status;
        state.stats.unregistered += 1;
        state.limiter.cleanup(Instant::now());
        debug!(worker_id = %id, status = ?status, live = state.workers.len(), "Worker unregistered");
        Ok(handle)
    }

    /// Forcefully remove a worker and its whole subtree, children first.
    pub fn teardown(&self, id: WorkerId) -> EnsembleResult<Vec<WorkerHandle>> {
        let mut state = self.state.lock();
        if !state.workers.contains_key(&id) {
            return Err(EnsembleError::Safety(format!("worker {id} is not registered")));
        }

        // Post-order walk so every child leaves before its parent.
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(kids) = state.children.get(&current) {
                for kid in kids {
                    stack.push((*kid, false));
                }
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for worker in order {
            if let Some(mut handle) = state.remove(worker) {
                handle.status = WorkerStatus::TornDown;
                removed.push(handle);
            }
        }
        state.stats.torn_down += removed.len() as u64;
        state.limiter.cleanup(Instant::now());
        info!(worker_id = %id, removed = removed.len(), "Worker subtree torn down");
        Ok(removed)
    }

    /// Narrow which worker types `parent` may spawn, e.g. for a nested
    /// meta-orchestrator with a smaller budget than the root.
    pub fn restrict_children(&self, parent: WorkerId, allowed: AllowedWorkers) -> EnsembleResult<()> {
        let mut state = self.state.lock();
        if !state.workers.contains_key(&parent) {
            return Err(EnsembleError::Safety(format!("worker {parent} is not registered")));
        }
        state.restrictions.insert(parent, allowed);
        Ok(())
    }

    /// Cap how many children `parent` may spawn from now on. Spawns beyond
    /// the cap are denied with [`DenyReason::ChildBudgetExhausted`].
    pub fn limit_children(&self, parent: WorkerId, max_children: usize) -> EnsembleResult<()> {
        let mut state = self.state.lock();
        if !state.workers.contains_key(&parent) {
            return Err(EnsembleError::Safety(format!("worker {parent} is not registered")));
        }
        state.budgets.insert(parent, max_children);
        Ok(())
    }

    /// Apply [`SafetyLimits::nested`] to `parent`.
    pub fn apply_nested_budget(&self, parent: WorkerId) -> EnsembleResult<()> {
        let budget = &self.limits.nested;
        self.restrict_children(parent, budget.allowed_worker_types.clone())?;
        self.limit_children(parent, budget.max_children)
    }

    /// Spawns `parent` may still perform, if it is budgeted.
    pub fn remaining_budget(&self, parent: WorkerId) -> Option<usize> {
        self.state.lock().budgets.get(&parent).copied()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Deepest level currently occupied, or `None` if no worker is live.
    pub fn max_live_depth(&self) -> Option<u32> {
        self.state.lock().workers.values().map(|h| h.depth).max()
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.state.lock().workers.get(&id).cloned()
    }

    pub fn children_of(&self, id: WorkerId) -> Vec<WorkerId> {
        self.state
            .lock()
            .children
            .get(&id)
            .map(|kids| kids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SpawnStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn approve(mgr: &SafetyManager, parent: Option<WorkerId>, w: WorkerType) -> WorkerHandle {
        match mgr.request_spawn(parent, w) {
            SpawnDecision::Approved(h) => h,
            SpawnDecision::Denied(r) => panic!("unexpected denial: {r}"),
        }
    }

    #[test]
    fn test_root_spawn_has_depth_zero() {
        let mgr = SafetyManager::new(SafetyLimits::default());
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        assert_eq!(root.depth, 0);
        assert_eq!(root.parent_id, None);
        let child = approve(&mgr, Some(root.id), WorkerType::Architect);
        assert_eq!(child.depth, 1);
        assert_eq!(mgr.children_of(root.id), vec![child.id]);
        assert_eq!(mgr.live_count(), 2);
    }

    #[test]
    fn test_max_agents_reached() {
        let mgr = SafetyManager::new(SafetyLimits::default().with_max_total_workers(2));
        approve(&mgr, None, WorkerType::Architect);
        approve(&mgr, None, WorkerType::BackendDeveloper);
        let third = mgr.request_spawn(None, WorkerType::QaEngineer);
        assert_eq!(third, SpawnDecision::Denied(DenyReason::MaxAgentsReached));
        assert_eq!(third.clone().into_result().unwrap_err().to_string(), "Spawn denied: max agents reached");
        assert_eq!(mgr.live_count(), 2);
    }

    #[test]
    fn test_max_depth_reached() {
        let mgr = SafetyManager::new(SafetyLimits::default().with_max_depth(1));
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        let child = approve(&mgr, Some(root.id), WorkerType::Orchestrator);
        let denied = mgr.request_spawn(Some(child.id), WorkerType::BackendDeveloper);
        assert_eq!(denied, SpawnDecision::Denied(DenyReason::MaxDepthReached));
        assert_eq!(mgr.max_live_depth(), Some(1));
    }

    #[test]
    fn test_rate_limited_per_parent() {
        let limits = SafetyLimits::default().with_rate(Duration::from_secs(60), 2);
        let mgr = SafetyManager::new(limits);
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        approve(&mgr, Some(root.id), WorkerType::Architect);
        approve(&mgr, Some(root.id), WorkerType::QaEngineer);
        assert_eq!(
            mgr.request_spawn(Some(root.id), WorkerType::CodeReviewer),
            SpawnDecision::Denied(DenyReason::RateLimited)
        );
        // The root window has one spawn in it; still room for another.
        approve(&mgr, None, WorkerType::GeneralPurpose);
    }

    #[test]
    fn test_type_not_permitted_global_and_restricted() {
        let limits = SafetyLimits::default().with_allowed(AllowedWorkers::only([
            WorkerType::Orchestrator,
            WorkerType::BackendDeveloper,
            WorkerType::QaEngineer,
        ]));
        let mgr = SafetyManager::new(limits);
        assert_eq!(
            mgr.request_spawn(None, WorkerType::DevopsEngineer),
            SpawnDecision::Denied(DenyReason::TypeNotPermitted)
        );

        let root = approve(&mgr, None, WorkerType::Orchestrator);
        mgr.restrict_children(root.id, AllowedWorkers::only([WorkerType::QaEngineer]))
            .unwrap();
        assert_eq!(
            mgr.request_spawn(Some(root.id), WorkerType::BackendDeveloper),
            SpawnDecision::Denied(DenyReason::TypeNotPermitted)
        );
        approve(&mgr, Some(root.id), WorkerType::QaEngineer);
    }

    #[test]
    fn test_child_budget_caps_spawns_per_parent() {
        let mgr = SafetyManager::new(SafetyLimits::default());
        let meta = approve(&mgr, None, WorkerType::Orchestrator);
        mgr.limit_children(meta.id, 2).unwrap();

        let first = approve(&mgr, Some(meta.id), WorkerType::Architect);
        approve(&mgr, Some(meta.id), WorkerType::BackendDeveloper);
        assert_eq!(mgr.remaining_budget(meta.id), Some(0));

        // Releasing a child does not refund the budget.
        mgr.unregister(first.id, WorkerStatus::Completed).unwrap();
        let denied = mgr.request_spawn(Some(meta.id), WorkerType::QaEngineer);
        assert_eq!(denied, SpawnDecision::Denied(DenyReason::ChildBudgetExhausted));
        assert_eq!(
            denied.into_result().unwrap_err().to_string(),
            "Spawn denied: child budget exhausted"
        );

        // Other parents are unaffected.
        approve(&mgr, None, WorkerType::QaEngineer);
        assert_eq!(mgr.remaining_budget(WorkerId::new()), None);
        assert!(mgr.limit_children(WorkerId::new(), 1).is_err());
    }

    #[test]
    fn test_nested_budget_from_limits() {
        let limits = SafetyLimits::default().with_nested(NestedBudget {
            max_children: 1,
            allowed_worker_types: AllowedWorkers::only([WorkerType::QaEngineer]),
        });
        let mgr = SafetyManager::new(limits);
        let meta = approve(&mgr, None, WorkerType::Orchestrator);
        mgr.apply_nested_budget(meta.id).unwrap();

        assert_eq!(
            mgr.request_spawn(Some(meta.id), WorkerType::Architect),
            SpawnDecision::Denied(DenyReason::TypeNotPermitted)
        );
        approve(&mgr, Some(meta.id), WorkerType::QaEngineer);
        assert_eq!(
            mgr.request_spawn(Some(meta.id), WorkerType::QaEngineer),
            SpawnDecision::Denied(DenyReason::ChildBudgetExhausted)
        );

        mgr.teardown(meta.id).unwrap();
        assert_eq!(mgr.remaining_budget(meta.id), None);
    }

    #[test]
    fn test_release_prunes_idle_rate_windows() {
        let limits = SafetyLimits::default().with_rate(Duration::from_millis(5), 10);
        let mgr = SafetyManager::new(limits);
        let a = approve(&mgr, None, WorkerType::Architect);
        let b = approve(&mgr, None, WorkerType::QaEngineer);
        assert_eq!(mgr.state.lock().limiter.tracked(), 1);

        std::thread::sleep(Duration::from_millis(20));
        mgr.unregister(a.id, WorkerStatus::Completed).unwrap();
        assert_eq!(mgr.state.lock().limiter.tracked(), 0);

        let c = approve(&mgr, Some(b.id), WorkerType::CodeReviewer);
        std::thread::sleep(Duration::from_millis(20));
        mgr.teardown(c.id).unwrap();
        // b's window went idle.
        assert_eq!(mgr.state.lock().limiter.tracked(), 0);
    }

    #[test]
    fn test_check_order_count_before_depth() {
        let limits = SafetyLimits::default().with_max_total_workers(1).with_max_depth(0);
        let mgr = SafetyManager::new(limits);
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        // Both the count and depth limits are violated; count is reported.
        assert_eq!(
            mgr.request_spawn(Some(root.id), WorkerType::Architect),
            SpawnDecision::Denied(DenyReason::MaxAgentsReached)
        );
    }

    #[test]
    fn test_unknown_parent_denied() {
        let mgr = SafetyManager::new(SafetyLimits::default());
        assert_eq!(
            mgr.request_spawn(Some(WorkerId::new()), WorkerType::Architect),
            SpawnDecision::Denied(DenyReason::UnknownParent)
        );
    }

    #[test]
    fn test_unregister_with_dangling_child_is_error() {
        let mgr = SafetyManager::new(SafetyLimits::default());
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        let child = approve(&mgr, Some(root.id), WorkerType::Architect);

        let err = mgr.unregister(root.id, WorkerStatus::Completed).unwrap_err();
        assert!(err.to_string().contains("live children"));
        assert_eq!(mgr.live_count(), 2);

        let done = mgr.unregister(child.id, WorkerStatus::Completed).unwrap();
        assert_eq!(done.status, WorkerStatus::Completed);
        mgr.unregister(root.id, WorkerStatus::Failed).unwrap();
        assert_eq!(mgr.live_count(), 0);
        assert!(mgr.unregister(root.id, WorkerStatus::Completed).is_err());
    }

    #[test]
    fn test_teardown_removes_subtree_children_first() {
        let mgr = SafetyManager::new(SafetyLimits::default());
        let root = approve(&mgr, None, WorkerType::Orchestrator);
        let mid = approve(&mgr, Some(root.id), WorkerType::Orchestrator);
        let leaf = approve(&mgr, Some(mid.id), WorkerType::BackendDeveloper);
        let other = approve(&mgr, None, WorkerType::QaEngineer);

        let removed = mgr.teardown(mid.id).unwrap();
        let ids: Vec<WorkerId> = removed.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![leaf.id, mid.id]);
        assert!(removed.iter().all(|h| h.status == WorkerStatus::TornDown));
        assert!(mgr.children_of(root.id).is_empty());
        assert!(mgr.get(other.id).is_some());
        assert_eq!(mgr.live_count(), 2);
        assert_eq!(mgr.stats().torn_down, 2);
    }

    #[test]
    fn test_denial_never_increases_live_count() {
        let mgr = SafetyManager::new(
            SafetyLimits::default()
                .with_max_total_workers(3)
                .with_max_depth(2),
        );
        let mut parents: Vec<Option<WorkerId>> = vec![None];
        for i in 0..50 {
            let parent = parents[i % parents.len()];
            let before = mgr.live_count();
            match mgr.request_spawn(parent, WorkerType::ALL[i % WorkerType::ALL.len()]) {
                SpawnDecision::Approved(h) => {
                    assert_eq!(mgr.live_count(), before + 1);
                    parents.push(Some(h.id));
                }
                SpawnDecision::Denied(_) => assert_eq!(mgr.live_count(), before),
            }
            assert!(mgr.live_count() <= 3);
            assert!(mgr.max_live_depth().unwrap_or(0) <= 2);
        }
    }

    #[test]
    fn test_allowed_workers_config_forms() {
        let all: AllowedWorkers = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, AllowedWorkers::All);
        let only: AllowedWorkers = serde_json::from_str("[\"architect\",\"qa_engineer\"]").unwrap();
        assert!(only.permits(WorkerType::Architect));
        assert!(!only.permits(WorkerType::DevopsEngineer));
        assert!(serde_json::from_str::<AllowedWorkers>("\"some\"").is_err());
    }

    #[test]
    fn test_limits_validate() {
        assert!(SafetyLimits::default().validate().is_ok());
        assert!(SafetyLimits::default()
            .with_max_total_workers(0)
            .validate()
            .is_err());
        let no_children = NestedBudget {
            max_children: 0,
            ..NestedBudget::default()
        };
        assert!(SafetyLimits::default().with_nested(no_children).validate().is_err());
    }
}
