use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_CHAT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub sender_name: String,
    pub text: String,
    /// Sent by the local user.
    pub own: bool,
    pub sent_at: DateTime<Utc>,
}

/// In-memory chat history for one call. Oldest entries are dropped once the
/// log is full.
#[derive(Debug)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    capacity: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHAT_CAPACITY)
    }
}

impl ChatLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CHAT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sender_name: impl Into<String>, text: impl Into<String>, own: bool) -> ChatEntry {
        let entry = ChatEntry {
            sender_name: sender_name.into(),
            text: text.into(),
            own,
            sent_at: Utc::now(),
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
