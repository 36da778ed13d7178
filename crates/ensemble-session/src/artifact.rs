use crate::session::{SessionContext, TimelineEntry, TimelineEvent};
use ensemble_core::{EnsembleResult, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Output document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    #[default]
    Markdown,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactOptions {
    #[serde(default)]
    pub format: ArtifactFormat,
    /// Append the raw timeline after the summary.
    #[serde(default)]
    pub include_timeline: bool,
    #[serde(default)]
    pub title: Option<String>,
}

/// A generated summary document. Writing it anywhere is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArtifact {
    pub session_id: Uuid,
    pub format: ArtifactFormat,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ParticipantSummary<'a> {
    worker: WorkerId,
    role: &'a str,
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    seq: u64,
    kind: &'static str,
    actor: WorkerId,
    target: Option<WorkerId>,
    keys: Vec<&'a str>,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct ArtifactDocument<'a> {
    session_id: Uuid,
    title: &'a str,
    archived: bool,
    participants: Vec<ParticipantSummary<'a>>,
    decisions: Vec<Decision<'a>>,
    outputs: BTreeMap<&'a str, BTreeMap<&'a str, &'a serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeline: Option<&'a [TimelineEntry]>,
}

const GENERAL_SECTION: &str = "general";

/// Replay the session into a summary of participants, decisions and outputs.
///
/// The output is a pure function of the session state: two calls without an
/// intervening update produce identical bytes.
pub fn generate(session: &SessionContext, options: &ArtifactOptions) -> EnsembleResult<SessionArtifact> {
    let doc = document(session, options);
    let content = match options.format {
        ArtifactFormat::Json => serde_json::to_string_pretty(&doc)?,
        ArtifactFormat::Markdown => render_markdown(&doc),
    };
    Ok(SessionArtifact {
        session_id: session.id,
        format: options.format,
        content,
    })
}

fn document<'a>(session: &'a SessionContext, options: &'a ArtifactOptions) -> ArtifactDocument<'a> {
    let mut participants: Vec<(&WorkerId, &crate::session::Participant)> =
        session.participants.iter().collect();
    participants.sort_by(|a, b| a.1.joined_at.cmp(&b.1.joined_at).then_with(|| a.0.cmp(b.0)));

    let decisions = session
        .timeline
        .iter()
        .map(|entry| match &entry.event {
            TimelineEvent::Update {
                contributor,
                keys,
                reason,
                ..
            } => Decision {
                seq: entry.seq,
                kind: "update",
                actor: *contributor,
                target: None,
                keys: keys.iter().map(String::as_str).collect(),
                reason,
            },
            TimelineEvent::Handoff { from, to, reason, .. } => Decision {
                seq: entry.seq,
                kind: "handoff",
                actor: *from,
                target: Some(*to),
                keys: Vec::new(),
                reason,
            },
        })
        .collect();

    let mut outputs: BTreeMap<&str, BTreeMap<&str, &serde_json::Value>> = BTreeMap::new();
    for (key, value) in &session.context {
        let (section, name) = key.rsplit_once('/').unwrap_or((GENERAL_SECTION, key.as_str()));
        outputs.entry(section).or_default().insert(name, value);
    }

    ArtifactDocument {
        session_id: session.id,
        title: options.title.as_deref().unwrap_or("Session summary"),
        archived: session.is_archived(),
        participants: participants
            .into_iter()
            .map(|(id, p)| ParticipantSummary {
                worker: *id,
                role: &p.role,
            })
            .collect(),
        decisions,
        outputs,
        timeline: options.include_timeline.then_some(session.timeline.as_slice()),
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_markdown(doc: &ArtifactDocument<'_>) -> String {
    let archived = if doc.archived { " (archived)" } else { "" };
    let mut lines = vec![
        format!("# {}", doc.title),
        String::new(),
        format!("Session: `{}`{archived}", doc.session_id),
        "\n## Participants\n".to_string(),
    ];
    if doc.participants.is_empty() {
        lines.push("_none_".to_string());
    }
    lines.extend(doc.participants.iter().map(|p| format!("- `{}` ({})", p.worker, p.role)));

    lines.push("\n## Decisions\n".to_string());
    if doc.decisions.is_empty() {
        lines.push("_none_".to_string());
    }
    lines.extend(doc.decisions.iter().map(|d| match d.target {
        Some(target) => format!("{}. handoff `{}` → `{}`: {}", d.seq, d.actor, target, d.reason),
        None => format!("{}. `{}` updated [{}]: {}", d.seq, d.actor, d.keys.join(", "), d.reason),
    }));

    lines.push("\n## Outputs".to_string());
    for (section, entries) in &doc.outputs {
        lines.push(format!("\n### {section}\n"));
        lines.extend(entries.iter().map(|(name, value)| format!("- **{name}**: {}", render_value(value))));
    }

    if let Some(timeline) = doc.timeline {
        lines.push("\n## Timeline\n".to_string());
        lines.extend(
            timeline
                .iter()
                .map(|entry| format!("- {}", serde_json::to_string(entry).unwrap_or_default())),
        );
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
