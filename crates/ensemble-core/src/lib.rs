//! Core types and error definitions for the Ensemble orchestration workspace.
//!
//! This crate provides the foundational types shared across all Ensemble crates.
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for all Ensemble subsystems.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`WorkerId`] — Identifier of a spawned worker.

/// Error kinds shared by every crate.
pub mod error;
/// Identifier newtypes.
pub mod ids;

pub use error::{EnsembleError, EnsembleResult};
pub use ids::WorkerId;
