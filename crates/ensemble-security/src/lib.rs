//! Capability catalog and spawn-safety primitives for Ensemble.
//!
//! Provides the static worker catalog and the gate that every worker spawn
//! passes through.
//!
//! # Main types
//!
//! - [`CapabilityRegistry`] — Read-only catalog of [`WorkerType`]s and their [`Capability`]s.
//! - [`SafetyManager`] — Enforces worker count, hierarchy depth and spawn-rate bounds.
//! - [`SafetyLimits`] — The bounds a [`SafetyManager`] enforces.
//! - [`SpawnRateLimiter`] — Sliding-window spawn counter keyed by parent.

/// Worker types, capabilities and the registry.
pub mod capability;
/// Sliding-window spawn rate limiting.
pub mod rate_limit;
/// The spawn gate and live hierarchy tree.
pub mod safety;

pub use capability::{
    Capability, CapabilityRegistry, OrchestrationMode, WorkerDescriptor, WorkerType,
};
pub use rate_limit::SpawnRateLimiter;
pub use safety::{
    AllowedWorkers, DenyReason, NestedBudget, SafetyLimits, SafetyManager, SpawnDecision, SpawnStats,
    WorkerHandle, WorkerStatus,
};
