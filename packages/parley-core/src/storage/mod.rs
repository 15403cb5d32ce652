//! # Storage Module
//!
//! The hosted store that holds key records, profiles, conversations and
//! message envelopes, seen through the [`Backend`] trait.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  KeyVault       │   │ MessagingSession│   │  Outbox         │       │
//! │  └────────┬────────┘   └────────┬────────┘   └────────┬────────┘       │
//! │           └─────────────────────┼─────────────────────┘                │
//! │                                 ▼                                       │
//! │                    ┌─────────────────────────┐                          │
//! │                    │   dyn Backend (async)   │                          │
//! │                    │  get / insert / update  │                          │
//! │                    │  subscribe / RPC        │                          │
//! │                    └────────────┬────────────┘                          │
//! │                  ┌──────────────┴──────────────┐                        │
//! │                  ▼                             ▼                        │
//! │       ┌────────────────────┐       ┌────────────────────┐               │
//! │       │  MemoryBackend     │       │  SqliteBackend     │               │
//! │       │  maps + broadcast  │       │  rusqlite + bcast  │               │
//! │       └────────────────────┘       └────────────────────┘               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything that crosses this boundary is already encrypted or public:
//! wrapped private keys, public keys, ciphertext and wrapped message keys.

mod database;
mod memory;
mod schema;

pub use database::SqliteBackend;
pub use memory::MemoryBackend;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::messaging::MessageEnvelope;

// ============================================================================
// RECORDS
// ============================================================================

/// A user's published key material
///
/// Written once per user; all key fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyRecord {
    /// Owner, unique across records
    pub user_id: String,
    /// X25519 public key
    pub public_key: String,
    /// Private key wrapped under the session password
    pub encrypted_private_key: String,
    /// Argon2id salt for the wrapping key
    pub key_salt: String,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Public profile data used to label conversations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Owner of the profile
    pub user_id: String,
    /// Unique handle
    pub username: String,
    /// Name shown in conversation lists, when set
    pub display_name: Option<String>,
    /// Avatar image location, when set
    pub avatar_url: Option<String>,
}

/// A direct conversation between two users
///
/// `participant_one < participant_two`, so each unordered pair maps to
/// exactly one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_one: String,
    pub participant_two: String,
    /// Unix milliseconds of the newest message, if any
    pub last_message_at: Option<i64>,
    /// Unix milliseconds
    pub created_at: i64,
}

impl Conversation {
    /// Whether `user_id` is one of the two participants
    pub fn involves(&self, user_id: &str) -> bool {
        self.participant_one == user_id || self.participant_two == user_id
    }

    /// The participant that is not `user_id`
    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.participant_one == user_id {
            &self.participant_two
        } else {
            &self.participant_one
        }
    }
}

/// Order a pair of user ids the way conversations store them
pub fn sorted_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Run a store call under a deadline
///
/// An elapsed deadline becomes `Error::Timeout` naming the operation.
pub(crate) async fn with_timeout<T, F>(limit: Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Store call {} exceeded {:?}", operation, limit);
            Err(Error::Timeout(format!("{} after {:?}", operation, limit)))
        }
    }
}

/// Newest conversation first; never-messaged conversations last
pub(crate) fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Live feed of newly inserted envelopes for one conversation
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    conversation_id: String,
    rx: broadcast::Receiver<MessageEnvelope>,
}

impl Subscription {
    pub(crate) fn new(conversation_id: &str, rx: broadcast::Receiver<MessageEnvelope>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            rx,
        }
    }

    /// The conversation this feed is filtered to
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Wait for the next insert into this conversation
    ///
    /// Returns `None` once the backend has shut down.
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.conversation_id == self.conversation_id => {
                    return Some(envelope)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Realtime feed for {} lagged, {} events skipped",
                        self.conversation_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// The hosted store, as seen by the messaging core
#[async_trait]
pub trait Backend: Send + Sync {
    // ---- key records ----

    /// Fetch a user's key record
    async fn get_key_record(&self, user_id: &str) -> Result<Option<StoredKeyRecord>>;

    /// Insert a key record; `KeyRecordExists` if the user already has one
    async fn insert_key_record(&self, record: StoredKeyRecord) -> Result<()>;

    // ---- profiles ----

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn upsert_profile(&self, profile: Profile) -> Result<()>;

    // ---- conversations ----

    /// Atomically fetch or create the conversation for an unordered pair
    async fn get_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Conversations involving `user_id`, newest activity first
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// Move `last_message_at` forward to `at` (never backwards)
    async fn touch_conversation(&self, conversation_id: &str, at: i64) -> Result<()>;

    // ---- messages ----

    /// Insert an envelope and notify subscribers
    ///
    /// Idempotent by message id: returns `false` and notifies nobody when the
    /// id is already stored.
    async fn insert_message(&self, envelope: MessageEnvelope) -> Result<bool>;

    /// Envelopes in a conversation, oldest first
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageEnvelope>>;

    /// Unread envelopes in a conversation not sent by `reader_id`
    async fn count_unread(&self, conversation_id: &str, reader_id: &str) -> Result<u64>;

    /// Mark every envelope not sent by `reader_id` read; returns how many changed
    async fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64>;

    /// Mark one envelope read; returns whether it changed
    async fn mark_message_read(&self, message_id: &str) -> Result<bool>;

    // ---- realtime ----

    /// Subscribe to inserts into one conversation
    async fn subscribe_messages(&self, conversation_id: &str) -> Result<Subscription>;
}

// ============================================================================
// TESTS
// ============================================================================
