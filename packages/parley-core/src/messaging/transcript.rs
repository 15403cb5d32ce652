//! Decrypted, render-ready message types.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::MessageType;
use crate::storage::{Conversation, Profile};

/// One message as the UI shows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// Plaintext, or the undecryptable placeholder
    pub content: String,
    pub message_type: MessageType,
    pub is_read: bool,
    /// Unix milliseconds
    pub created_at: i64,
    /// Written by the viewing user
    pub is_outgoing: bool,
    /// `false` when `content` is the placeholder
    pub decrypted: bool,
}

/// A row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    /// The other participant
    pub peer_id: String,
    /// `None` when the peer has no profile
    pub peer: Option<Profile>,
    /// Messages from the peer not yet read
    pub unread_count: u64,
}

/// Ordered transcript with id de-duplication
///
/// History and realtime events arrive from two unordered sources; the seen
/// set keeps each message id exactly once.
#[derive(Debug, Default)]
pub(crate) struct Transcript {
    entries: Vec<TranscriptEntry>,
    seen: HashSet<String>,
}

impl Transcript {
    /// Whether `id` is already present
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Insert in `created_at` order; `false` if the id was already present
    pub fn insert(&mut self, entry: TranscriptEntry) -> bool {
        if !self.seen.insert(entry.id.clone()) {
            return false;
        }
        let at = self.entries.partition_point(|e| e.created_at <= entry.created_at);
        self.entries.insert(at, entry);
        true
    }

    /// Copy of the entries, oldest first
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, at: i64) -> TranscriptEntry {
        TranscriptEntry {
            id: id.into(),
            conversation_id: "c".into(),
            sender_id: "alice".into(),
            content: id.into(),
            message_type: MessageType::Text,
            is_read: false,
            created_at: at,
            is_outgoing: false,
            decrypted: true,
        }
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let mut t = Transcript::default();
        assert!(t.insert(entry("m1", 1)));
        assert!(!t.insert(entry("m1", 1)));
        assert_eq!(t.len(), 1);
        assert!(t.contains("m1"));
    }

    #[test]
    fn test_out_of_order_arrival_is_sorted() {
        let mut t = Transcript::default();
        t.insert(entry("c", 30));
        t.insert(entry("a", 10));
        t.insert(entry("b", 20));
        t.insert(entry("b2", 20));
        let ids: Vec<_> = t.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b", "b2", "c"]);
    }
}
