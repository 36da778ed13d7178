use chrono::{DateTime, Utc};
use ensemble_core::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Delivery priority. Ordering is `Low < Normal < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background chatter.
    Low,
    /// The default for workers.
    #[default]
    Normal,
    /// Orchestrator traffic and introductions.
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Addressee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single worker's mailbox.
    Worker(WorkerId),
    /// Every registered worker except the sender.
    Broadcast,
}

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Point-to-point message.
    Direct,
    /// Fan-out to all workers.
    Broadcast,
    /// Answer to a request; shares its correlation id.
    Reply,
    /// Sent to the receiving worker of a handoff.
    Introduction,
}

/// A message between workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per message.
    pub id: Uuid,
    /// Sender.
    pub from: WorkerId,
    /// Addressee.
    pub to: Recipient,
    /// Free-form text.
    pub content: String,
    /// Delivery priority.
    pub priority: Priority,
    /// The sender waits for a reply.
    pub requires_response: bool,
    /// Shared by a request and all of its replies.
    pub correlation_id: Uuid,
    /// Message category.
    pub kind: MessageKind,
    /// When the message was created.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// A normal-priority message with a fresh correlation id.
    pub fn new(from: WorkerId, to: Recipient, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            content: content.into(),
            priority: Priority::Normal,
            requires_response: false,
            correlation_id: Uuid::new_v4(),
            kind,
            sent_at: Utc::now(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Build a reply that carries this message's correlation id back to its sender.
    pub fn reply(&self, from: WorkerId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to: Recipient::Worker(self.from),
            content: content.into(),
            priority: self.priority,
            requires_response: false,
            correlation_id: self.correlation_id,
            kind: MessageKind::Reply,
            sent_at: Utc::now(),
        }
    }
}

/// Options for [`Messenger::send`](crate::Messenger::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// `None` picks `High` for the primary orchestrator and `Normal` otherwise.
    pub priority: Option<Priority>,
    /// Wait for a correlated reply.
    pub requires_response: bool,
    /// Overrides the messenger's default response timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Send with an explicit priority.
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    /// Send and wait for the reply.
    pub fn request() -> Self {
        Self {
            requires_response: true,
            ..Self::default()
        }
    }

    /// Override the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The message was queued for the recipient.
    Ack {
        /// Id of the queued message.
        message_id: Uuid,
        /// Thread id for later replies.
        correlation_id: Uuid,
    },
    /// The correlated reply to a `requires_response` message.
    Response(Message),
}

impl SendOutcome {
    /// The reply, if this outcome carries one.
    pub fn response(&self) -> Option<&Message> {
        match self {
            Self::Response(m) => Some(m),
            Self::Ack { .. } => None,
        }
    }
}

/// Filter over the messenger's audit log. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Match the sender.
    pub from: Option<WorkerId>,
    /// Match the addressee.
    pub to: Option<Recipient>,
    /// Match one request thread.
    pub correlation_id: Option<Uuid>,
    /// Match the message kind.
    pub kind: Option<MessageKind>,
}

impl HistoryFilter {
    /// Whether `message` passes every set field.
    pub fn matches(&self, message: &Message) -> bool {
        self.from.map_or(true, |f| f == message.from)
            && self.to.map_or(true, |t| t == message.to)
            && self.correlation_id.map_or(true, |c| c == message.correlation_id)
            && self.kind.map_or(true, |k| k == message.kind)
    }
}
