//! Shared session context for Ensemble workflows.
//!
//! A session is a versioned, append-only record of what every participating
//! worker contributed, plus the handoffs between them.
//!
//! # Main types
//!
//! - [`Session`] — Thread-safe handle; every operation is atomic.
//! - [`SessionContext`] — The serializable state: participants, context, timeline.
//! - [`SnapshotStore`] — Persistence seam for periodic snapshots.

/// Summary documents generated by replaying a session.
pub mod artifact;
/// Session state, timeline and context views.
pub mod session;
/// Snapshot stores and the periodic snapshotter.
pub mod store;

pub use artifact::{ArtifactFormat, ArtifactOptions, SessionArtifact};
pub use session::{
    ContextMap, ContextView, HandoffRecord, Participant, Session, SessionContext, TimelineEntry,
    TimelineEvent,
};
pub use store::{spawn_snapshotter, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
