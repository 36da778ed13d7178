use crate::artifact::{self, ArtifactOptions, SessionArtifact};
use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult, WorkerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Current value of every context key.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

/// A worker taking part in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub role: String,
    /// Key prefixes this participant cares about; drives [`ContextView::relevant`].
    pub interests: Vec<String>,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    Update {
        contributor: WorkerId,
        keys: Vec<String>,
        /// The merged patch, so every superseded value stays recoverable.
        values: ContextMap,
        reason: String,
    },
    Handoff {
        from: WorkerId,
        to: WorkerId,
        reason: String,
        /// Full context as visible to `to` at the time of the handoff.
        snapshot: ContextMap,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// 1-based insertion sequence; totally orders the timeline.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: TimelineEvent,
}

/// A handoff as seen by its receiving worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub seq: u64,
    pub from: WorkerId,
    pub to: WorkerId,
    pub reason: String,
    pub snapshot: ContextMap,
    pub at: DateTime<Utc>,
}

/// What a participant gets back from [`Session::context_for`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextView {
    pub version: u64,
    pub full: ContextMap,
    /// The subset of `full` matching the participant's interests.
    pub relevant: ContextMap,
    /// Most recent handoff addressed to this participant.
    pub last_handoff: Option<HandoffRecord>,
}

// ---------------------------------------------------------------------------
// SessionContext
// ---------------------------------------------------------------------------

/// Versioned, append-only shared state for one workflow or conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: Uuid,
    pub participants: BTreeMap<WorkerId, Participant>,
    pub context: ContextMap,
    pub timeline: Vec<TimelineEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            participants: BTreeMap::new(),
            context: ContextMap::new(),
            timeline: Vec::new(),
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// Number of timeline entries; bumps on every update and handoff.
    pub fn version(&self) -> u64 {
        self.timeline.len() as u64
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    fn ensure_writable(&self) -> EnsembleResult<()> {
        if self.is_archived() {
            return Err(EnsembleError::Session(format!(
                "session {} is archived and read-only",
                self.id
            )));
        }
        Ok(())
    }

    /// Add a participant, or refresh the role and interests of an existing one.
    ///
    /// An empty `interests` list defaults to the role name.
    pub fn join(&mut self, worker: WorkerId, role: &str, interests: Vec<String>) -> EnsembleResult<()> {
        self.ensure_writable()?;
        let interests = if interests.is_empty() {
            vec![role.to_string()]
        } else {
            interests
        };
        let joined_at = self
            .participants
            .get(&worker)
            .map_or_else(Utc::now, |p| p.joined_at);
        self.participants.insert(
            worker,
            Participant {
                role: role.to_string(),
                interests,
                joined_at,
            },
        );
        Ok(())
    }

    pub fn is_participant(&self, worker: WorkerId) -> bool {
        self.participants.contains_key(&worker)
    }

    /// Shallow-merge `patch` into the context and record it on the timeline.
    ///
    /// Returns the new version.
    pub fn update(&mut self, contributor: WorkerId, patch: ContextMap, reason: &str) -> EnsembleResult<u64> {
        self.ensure_writable()?;
        let keys: Vec<String> = patch.keys().cloned().collect();
        for (key, value) in &patch {
            self.context.insert(key.clone(), value.clone());
        }
        let seq = self.push(TimelineEvent::Update {
            contributor,
            keys,
            values: patch,
            reason: reason.to_string(),
        });
        Ok(seq)
    }

    /// Append a handoff entry carrying the full current context.
    ///
    /// The receiving worker must already be a participant.
    pub fn record_handoff(&mut self, from: WorkerId, to: WorkerId, reason: &str) -> EnsembleResult<HandoffRecord> {
        self.ensure_writable()?;
        if !self.is_participant(to) {
            return Err(EnsembleError::Session(format!(
                "handoff target {to} has not joined session {}",
                self.id
            )));
        }
        let snapshot = self.context.clone();
        let seq = self.push(TimelineEvent::Handoff {
            from,
            to,
            reason: reason.to_string(),
            snapshot: snapshot.clone(),
        });
        let at = self.timeline.last().map_or_else(Utc::now, |e| e.at);
        Ok(HandoffRecord {
            seq,
            from,
            to,
            reason: reason.to_string(),
            snapshot,
            at,
        })
    }

    fn push(&mut self, event: TimelineEvent) -> u64 {
        let seq = self.version() + 1;
        self.timeline.push(TimelineEntry {
            seq,
            at: Utc::now(),
            event,
        });
        seq
    }

    pub fn context_for(&self, worker: WorkerId) -> EnsembleResult<ContextView> {
        let participant = self.participants.get(&worker).ok_or_else(|| {
            EnsembleError::Session(format!("worker {worker} is not a participant of session {}", self.id))
        })?;

        let relevant = self
            .context
            .iter()
            .filter(|(key, _)| participant.interests.iter().any(|i| key.starts_with(i.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let last_handoff = self.timeline.iter().rev().find_map(|entry| match &entry.event {
            TimelineEvent::Handoff {
                from,
                to,
                reason,
                snapshot,
            } if *to == worker => Some(HandoffRecord {
                seq: entry.seq,
                from: *from,
                to: *to,
                reason: reason.clone(),
                snapshot: snapshot.clone(),
                at: entry.at,
            }),
            _ => None,
        });

        Ok(ContextView {
            version: self.version(),
            full: self.context.clone(),
            relevant,
            last_handoff,
        })
    }

    /// Every value `key` has held, oldest first, with its contributor.
    pub fn history_of(&self, key: &str) -> Vec<(u64, WorkerId, serde_json::Value)> {
        self.timeline
            .iter()
            .filter_map(|entry| match &entry.event {
                TimelineEvent::Update {
                    contributor,
                    values,
                    ..
                } => values.get(key).map(|v| (entry.seq, *contributor, v.clone())),
                TimelineEvent::Handoff { .. } => None,
            })
            .collect()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Session (shared handle)
// ---------------------------------------------------------------------------

/// Thread-safe handle over a [`SessionContext`].
///
/// Each method takes the lock once, so read-merge-append is atomic and
/// concurrent contributors resolve by last-write-wins on the current value.
pub struct Session {
    id: Uuid,
    inner: RwLock<SessionContext>,
}

impl Session {
    pub fn new() -> Self {
        Self::from_context(SessionContext::new())
    }

    /// Resume from a stored snapshot.
    pub fn from_context(context: SessionContext) -> Self {
        Self {
            id: context.id,
            inner: RwLock::new(context),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn join(&self, worker: WorkerId, role: &str, interests: Vec<String>) -> EnsembleResult<()> {
        self.inner.write().join(worker, role, interests)
    }

    pub fn is_participant(&self, worker: WorkerId) -> bool {
        self.inner.read().is_participant(worker)
    }

    pub fn update_context(&self, contributor: WorkerId, patch: ContextMap, reason: &str) -> EnsembleResult<u64> {
        let version = self.inner.write().update(contributor, patch, reason)?;
        debug!(session_id = %self.id, contributor = %contributor, version, "Context updated");
        Ok(version)
    }

    pub fn record_handoff(&self, from: WorkerId, to: WorkerId, reason: &str) -> EnsembleResult<HandoffRecord> {
        self.inner.write().record_handoff(from, to, reason)
    }

    pub fn context_for(&self, worker: WorkerId) -> EnsembleResult<ContextView> {
        self.inner.read().context_for(worker)
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version()
    }

    pub fn history_of(&self, key: &str) -> Vec<(u64, WorkerId, serde_json::Value)> {
        self.inner.read().history_of(key)
    }

    /// A point-in-time copy of the whole session.
    pub fn snapshot(&self) -> SessionContext {
        self.inner.read().clone()
    }

    /// Mark the session read-only. Idempotent.
    pub fn archive(&self) {
        let mut inner = self.inner.write();
        if inner.archived_at.is_none() {
            inner.archived_at = Some(Utc::now());
        }
    }

    pub fn is_archived(&self) -> bool {
        self.inner.read().is_archived()
    }

    pub fn generate_artifacts(&self, options: &ArtifactOptions) -> EnsembleResult<SessionArtifact> {
        artifact::generate(&self.inner.read(), options)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
