/// Message Reconciler: fan-in of two at-least-once sources, deduplicated by id
///
/// The log is append-only and keyed by message id; the sorted view is kept
/// ordered by `created_at`, ties in insertion order.
use crate::messenger_types::Message;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    seen: HashSet<String>,
    ordered: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Self {
        let mut log = Self::new();
        log.extend(messages);
        log
    }

    /// Insert unless the id is already known. Returns whether it was new.
    pub fn insert(&mut self, message: &Message) -> bool {
        if self.seen.contains(&message.id) {
            return false;
        }
        let at = self
            .ordered
            .partition_point(|m| m.created_at <= message.created_at);
        self.ordered.insert(at, message.clone());
        self.seen.insert(message.id.clone());
        true
    }

    /// Insert a batch. Returns how many were new.
    pub fn extend<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) -> usize {
        messages
            .into_iter()
            .filter(|m| self.insert(m))
            .count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.ordered.last()
    }

    pub fn messages(&self) -> &[Message] {
        &self.ordered
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.ordered.clone()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.ordered.clear();
    }
}

/// Pure merge: `history` then `incoming`, first copy of an id wins,
/// ascending by `created_at`.
pub fn merge(history: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut log = MessageLog::from_messages(history);
    log.extend(incoming);
    log.snapshot()
}
