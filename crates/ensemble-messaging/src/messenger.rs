use crate::mailbox::Mailbox;
use crate::message::{HistoryFilter, Message, MessageKind, Priority, Recipient, SendOptions, SendOutcome};
use ensemble_core::{EnsembleError, EnsembleResult, WorkerId};
use ensemble_session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of a handoff.
#[derive(Debug, Clone)]
pub struct HandoffOptions {
    /// Recorded on the session timeline.
    pub reason: String,
    /// Role the receiving worker joins the session with.
    pub role: String,
    /// Context key prefixes the receiver cares about; empty means its role.
    pub interests: Vec<String>,
}

impl HandoffOptions {
    /// Handoff with no explicit interests.
    pub fn new(reason: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            role: role.into(),
            interests: Vec::new(),
        }
    }

    /// Set the receiver's interests.
    pub fn with_interests(mut self, interests: Vec<String>) -> Self {
        self.interests = interests;
        self
    }
}

/// Acknowledgement of a completed handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffAck {
    /// Timeline sequence of the handoff entry.
    pub seq: u64,
    /// Id of the queued introduction message.
    pub introduction_id: Uuid,
}

/// In-process message bus between workers.
///
/// Each registered worker owns a [`Mailbox`]. All sends are recorded in an
/// append-only log that [`Messenger::history`] filters.
pub struct Messenger {
    primary: Option<WorkerId>,
    response_timeout: Duration,
    mailboxes: Mutex<HashMap<WorkerId, Mailbox>>,
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    log: Mutex<Vec<Message>>,
}

impl Messenger {
    /// A messenger with no primary and a 30 s response timeout.
    pub fn new() -> Self {
        Self {
            primary: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            mailboxes: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Messages sent by `worker` default to high priority.
    pub fn with_primary(mut self, worker: WorkerId) -> Self {
        self.primary = Some(worker);
        self
    }

    /// Default wait for replies to requests.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// The worker whose messages default to high priority.
    pub fn primary(&self) -> Option<WorkerId> {
        self.primary
    }

    /// Create a mailbox for `worker`. Registering twice keeps the existing one.
    pub fn register(&self, worker: WorkerId) {
        self.mailboxes.lock().entry(worker).or_default();
    }

    /// Drop `worker`'s mailbox and any messages still queued in it.
    pub fn unregister(&self, worker: WorkerId) -> usize {
        let removed = self.mailboxes.lock().remove(&worker);
        match removed {
            Some(mailbox) => {
                let dropped = mailbox.len();
                mailbox.notifier().notify_one();
                dropped
            }
            None => 0,
        }
    }

    /// Whether `worker` has a mailbox.
    pub fn is_registered(&self, worker: WorkerId) -> bool {
        self.mailboxes.lock().contains_key(&worker)
    }

    fn default_priority(&self, from: WorkerId) -> Priority {
        if self.primary == Some(from) {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    fn deliver(&self, to: WorkerId, message: Message, front: bool) -> EnsembleResult<()> {
        {
            let mut mailboxes = self.mailboxes.lock();
            let mailbox = mailboxes
                .get_mut(&to)
                .ok_or_else(|| EnsembleError::Delivery(format!("worker {to} has no mailbox")))?;
            debug!(
                message_id = %message.id,
                from = %message.from,
                to = %to,
                priority = %message.priority,
                "Message routed"
            );
            if front {
                mailbox.push_front(message.clone());
            } else {
                mailbox.push(message.clone());
            }
        }
        self.log.lock().push(message);
        Ok(())
    }

    /// Send `content` to `to`.
    ///
    /// With `requires_response` set, waits for the correlated [`Messenger::reply`]
    /// and fails with `DeliveryTimeout` when none arrives in time.
    pub async fn send(
        &self,
        from: WorkerId,
        to: WorkerId,
        content: impl Into<String>,
        options: SendOptions,
    ) -> EnsembleResult<SendOutcome> {
        let priority = options.priority.unwrap_or_else(|| self.default_priority(from));
        let mut message =
            Message::new(from, Recipient::Worker(to), content, MessageKind::Direct).with_priority(priority);
        message.requires_response = options.requires_response;
        let message_id = message.id;
        let correlation_id = message.correlation_id;

        if !options.requires_response {
            self.deliver(to, message, false)?;
            return Ok(SendOutcome::Ack {
                message_id,
                correlation_id,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(correlation_id, tx);
        // Clears the waiter on every exit, including a dropped future.
        let _waiter = Waiter {
            waiting: &self.waiting,
            correlation_id,
        };
        self.deliver(to, message, false)?;

        let timeout = options.timeout.unwrap_or(self.response_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(SendOutcome::Response(reply)),
            Ok(Err(_)) => Err(EnsembleError::Delivery(format!(
                "request {correlation_id} was abandoned before a reply"
            ))),
            Err(_) => {
                warn!(%correlation_id, from = %from, to = %to, "No reply before timeout");
                Err(EnsembleError::DeliveryTimeout {
                    correlation_id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Answer `request`. A sender still waiting on it receives the reply
    /// directly; otherwise the reply is queued in the sender's mailbox.
    pub fn reply(&self, request: &Message, from: WorkerId, content: impl Into<String>) -> EnsembleResult<Uuid> {
        let reply = request.reply(from, content);
        let reply_id = reply.id;
        let waiter = self.waiting.lock().remove(&request.correlation_id);
        match waiter {
            Some(tx) => match tx.send(reply.clone()) {
                Ok(()) => self.log.lock().push(reply),
                // The sender gave up between timeout and removal.
                Err(reply) => self.deliver(request.from, reply, false)?,
            },
            None => self.deliver(request.from, reply, false)?,
        }
        Ok(reply_id)
    }

    /// Deliver `content` to every registered worker except `from`.
    ///
    /// Returns the number of recipients.
    pub fn broadcast(&self, from: WorkerId, content: impl Into<String>, priority: Option<Priority>) -> usize {
        let priority = priority.unwrap_or_else(|| self.default_priority(from));
        let message =
            Message::new(from, Recipient::Broadcast, content, MessageKind::Broadcast).with_priority(priority);
        let delivered = {
            let mut mailboxes = self.mailboxes.lock();
            let mut count = 0;
            for (worker, mailbox) in &mut *mailboxes {
                if *worker != from {
                    mailbox.push(message.clone());
                    count += 1;
                }
            }
            count
        };
        debug!(message_id = %message.id, from = %from, recipients = delivered, "Broadcast routed");
        self.log.lock().push(message);
        delivered
    }

    /// Transfer conversational ownership from `from` to `to`.
    ///
    /// Joins `to` to the session, records the handoff with a full context
    /// snapshot, then queues an introduction ahead of anything already
    /// waiting in `to`'s mailbox. Registers `to` when needed.
    pub fn handoff(
        &self,
        from: WorkerId,
        to: WorkerId,
        session: &Session,
        options: HandoffOptions,
    ) -> EnsembleResult<HandoffAck> {
        session.join(to, &options.role, options.interests)?;
        let record = session.record_handoff(from, to, &options.reason)?;

        let mut content = format!("Handoff from {from}: {}\n", options.reason);
        if record.snapshot.is_empty() {
            content.push_str("No prior outputs.\n");
        } else {
            content.push_str("Prior outputs:\n");
            for (key, value) in &record.snapshot {
                content.push_str(&format!("- {key}: {}\n", summarize(value)));
            }
        }

        let intro = Message::new(from, Recipient::Worker(to), content, MessageKind::Introduction)
            .with_priority(Priority::High);
        let introduction_id = intro.id;
        self.register(to);
        self.deliver(to, intro, true)?;

        info!(
            session_id = %session.id(),
            from = %from,
            to = %to,
            seq = record.seq,
            "Handoff recorded"
        );
        Ok(HandoffAck {
            seq: record.seq,
            introduction_id,
        })
    }

    /// Wait for the next message for `worker`.
    pub async fn recv(&self, worker: WorkerId) -> EnsembleResult<Message> {
        loop {
            let notify = {
                let mut mailboxes = self.mailboxes.lock();
                let mailbox = mailboxes
                    .get_mut(&worker)
                    .ok_or_else(|| EnsembleError::Delivery(format!("worker {worker} has no mailbox")))?;
                if let Some(message) = mailbox.pop() {
                    return Ok(message);
                }
                mailbox.notifier()
            };
            notify.notified().await;
        }
    }

    /// Next message for `worker` without waiting.
    pub fn try_recv(&self, worker: WorkerId) -> Option<Message> {
        self.mailboxes.lock().get_mut(&worker).and_then(Mailbox::pop)
    }

    /// Number of messages queued for `worker`.
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.mailboxes.lock().get(&worker).map_or(0, Mailbox::len)
    }

    /// Requests still waiting for a reply.
    pub fn awaiting_replies(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Logged messages matching `filter`, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Message> {
        self.log
            .lock()
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }
}

/// Removes a request's reply slot when its `send` returns or is dropped.
struct Waiter<'a> {
    waiting: &'a Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    correlation_id: Uuid,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.waiting.lock().remove(&self.correlation_id);
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(value: &serde_json::Value) -> String {
    const MAX: usize = 200;
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= MAX {
        text
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
