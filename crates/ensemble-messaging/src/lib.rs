//! Priority-ordered messaging between Ensemble workers.
//!
//! # Main types
//!
//! - [`Messenger`] — Routes direct sends, broadcasts, replies and handoffs.
//! - [`Mailbox`] — Per-worker inbox ordered by priority, then arrival.
//! - [`Message`] — A routed message with its correlation id.

/// Per-worker inboxes.
pub mod mailbox;
/// Message types, send options and history filters.
pub mod message;
/// The message bus and the handoff protocol.
pub mod messenger;

pub use mailbox::Mailbox;
pub use message::{HistoryFilter, Message, MessageKind, Priority, Recipient, SendOptions, SendOutcome};
pub use messenger::{HandoffAck, HandoffOptions, Messenger};
