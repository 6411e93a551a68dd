/// Ordered, deduplicated message sequence and its merge rules
use crate::model::Message;
use std::collections::HashSet;

/// The visible sequence
///
/// Always sorted by `(timestamp, id)` with unique ids. All methods keep that
/// invariant; the feed itself does no I/O.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Feed {
    messages: Vec<Message>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a feed from messages in any order. Later duplicates of an id
    /// are dropped.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut feed = Self { messages };
        feed.normalize();
        feed
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Latest timestamp among messages from `sender_id`
    pub fn latest_from(&self, sender_id: &str) -> Option<i64> {
        self.messages
            .iter()
            .filter(|message| message.sender_id == sender_id)
            .map(|message| message.timestamp)
            .max()
    }

    /// Adds a locally created message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.normalize();
    }

    /// Merges confirmed entries from a snapshot. Returns whether anything
    /// changed.
    ///
    /// An entry whose id is already present replaces that message, so the
    /// backend's copy wins. Otherwise it supersedes the first pending message
    /// with the same content, or is added as new. Applying the same batch twice changes nothing the
    /// second time.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) -> bool {
        let before = self.messages.clone();
        for confirmed in incoming {
            if let Some(existing) = self.messages.iter_mut().find(|m| m.id == confirmed.id) {
                *existing = confirmed;
                continue;
            }
            let pending = self
                .messages
                .iter_mut()
                .find(|m| m.is_pending() && m.same_content(&confirmed));
            match pending {
                Some(pending) => *pending = confirmed,
                None => self.messages.push(confirmed),
            }
        }
        self.normalize();
        self.messages != before
    }

    /// Replaces the local id of a pending message with the id the backend
    /// assigned to it. When a message with the backend id is already present
    /// the pending copy is superseded by it. Returns whether anything changed.
    pub fn rekey(&mut self, local_id: &str, remote_id: &str) -> bool {
        let Some(index) = self.messages.iter().position(|m| m.id == local_id) else {
            return false;
        };
        if self.messages[index].id == remote_id {
            return false;
        }
        if self.messages.iter().any(|m| m.id == remote_id) {
            self.messages.remove(index);
        } else {
            self.messages[index].id = remote_id.to_string();
        }
        self.normalize();
        true
    }

    fn normalize(&mut self) {
        self.messages
            .sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        let mut seen = HashSet::new();
        self.messages.retain(|message| seen.insert(message.id.clone()));
    }
}
