use crate::message::{Message, Priority};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

struct Queued {
    priority: Priority,
    seq: u64,
    message: Message,
}

impl Queued {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// One recipient's inbox: priority first, then arrival order.
///
/// Messages pushed with [`Mailbox::push_front`] bypass the heap and are
/// delivered before anything else, oldest first.
pub struct Mailbox {
    front: VecDeque<Message>,
    queue: BinaryHeap<Queued>,
    next_seq: u64,
    notify: Arc<Notify>,
}

impl Mailbox {
    /// An empty mailbox.
    pub fn new() -> Self {
        Self {
            front: VecDeque::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queue by priority, first-in first-out within a priority.
    pub fn push(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Queued {
            priority: message.priority,
            seq,
            message,
        });
        self.notify.notify_one();
    }

    /// Queue ahead of every prioritized message.
    pub fn push_front(&mut self, message: Message) {
        self.front.push_back(message);
        self.notify.notify_one();
    }

    /// Next message to deliver.
    pub fn pop(&mut self) -> Option<Message> {
        self.front
            .pop_front()
            .or_else(|| self.queue.pop().map(|q| q.message))
    }

    /// Messages waiting.
    pub fn len(&self) -> usize {
        self.front.len() + self.queue.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes a receiver waiting on this mailbox.
    pub(crate) fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
