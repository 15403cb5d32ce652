//! In-process backend.
//!
//! Backs the test suite and the demo. Two knobs simulate a flaky hosted
//! store: [`MemoryBackend::set_failing`] makes every call fail as if the
//! network dropped, [`MemoryBackend::set_writes_failing`] rejects only
//! writes, and [`MemoryBackend::set_latency`] delays every call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{sort_by_recency, sorted_pair, Backend, Conversation, Profile, StoredKeyRecord, Subscription};
use crate::error::{Error, Result};
use crate::messaging::MessageEnvelope;
use crate::time::now_timestamp_millis;

#[derive(Default)]
struct State {
    keys: HashMap<String, StoredKeyRecord>,
    profiles: HashMap<String, Profile>,
    conversations: HashMap<String, Conversation>,
    /// (participant_one, participant_two) → conversation id
    pairs: HashMap<(String, String), String>,
    /// conversation id → envelopes in insertion order
    messages: HashMap<String, Vec<MessageEnvelope>>,
    message_ids: HashSet<String>,
}

/// `Backend` held entirely in memory
pub struct MemoryBackend {
    state: RwLock<State>,
    events: broadcast::Sender<MessageEnvelope>,
    failing: AtomicBool,
    writes_failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    /// Create an empty backend whose realtime channel holds `buffer` events
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            state: RwLock::new(State::default()),
            events,
            failing: AtomicBool::new(false),
            writes_failing: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every subsequent write fail while reads keep working
    pub fn set_writes_failing(&self, failing: bool) {
        self.writes_failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of live realtime subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Total envelopes stored across all conversations
    pub fn message_count(&self) -> usize {
        self.state.read().message_ids.len()
    }

    async fn gate_read(&self) -> Result<()> {
        self.delay().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StorageReadError("backend unreachable".into()));
        }
        Ok(())
    }

    async fn gate_write(&self) -> Result<()> {
        self.delay().await;
        if self.failing.load(Ordering::SeqCst) || self.writes_failing.load(Ordering::SeqCst) {
            return Err(Error::StorageWriteError("backend unreachable".into()));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_key_record(&self, user_id: &str) -> Result<Option<StoredKeyRecord>> {
        self.gate_read().await?;
        Ok(self.state.read().keys.get(user_id).cloned())
    }

    async fn insert_key_record(&self, record: StoredKeyRecord) -> Result<()> {
        self.gate_write().await?;
        let mut state = self.state.write();
        if state.keys.contains_key(&record.user_id) {
            return Err(Error::KeyRecordExists);
        }
        state.keys.insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.gate_read().await?;
        Ok(self.state.read().profiles.get(user_id).cloned())
    }

    async fn upsert_profile(&self, profile: Profile) -> Result<()> {
        self.gate_write().await?;
        self.state.write().profiles.insert(profile.user_id.clone(), profile);
        Ok(())
    }

    async fn get_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<Conversation> {
        self.gate_write().await?;
        let (one, two) = sorted_pair(user_a, user_b);
        let key = (one.to_string(), two.to_string());

        // Single write lock makes lookup + insert atomic.
        let mut state = self.state.write();
        if let Some(existing) = state.pairs.get(&key).and_then(|id| state.conversations.get(id)) {
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            participant_one: key.0.clone(),
            participant_two: key.1.clone(),
            last_message_at: None,
            created_at: now_timestamp_millis(),
        };
        state.pairs.insert(key, conversation.id.clone());
        state.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.gate_read().await?;
        Ok(self.state.read().conversations.get(conversation_id).cloned())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.gate_read().await?;
        let mut conversations: Vec<Conversation> = self
            .state
            .read()
            .conversations
            .values()
            .filter(|c| c.involves(user_id))
            .cloned()
            .collect();
        sort_by_recency(&mut conversations);
        Ok(conversations)
    }

    async fn touch_conversation(&self, conversation_id: &str, at: i64) -> Result<()> {
        self.gate_write().await?;
        let mut state = self.state.write();
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or(Error::ConversationNotFound)?;
        conversation.last_message_at = Some(conversation.last_message_at.map_or(at, |prev| prev.max(at)));
        Ok(())
    }

    async fn insert_message(&self, envelope: MessageEnvelope) -> Result<bool> {
        self.gate_write().await?;
        {
            let mut state = self.state.write();
            if !state.conversations.contains_key(&envelope.conversation_id) {
                return Err(Error::ConversationNotFound);
            }
            if !state.message_ids.insert(envelope.id.clone()) {
                return Ok(false);
            }
            state
                .messages
                .entry(envelope.conversation_id.clone())
                .or_default()
                .push(envelope.clone());
        }
        // No receivers is fine.
        let _ = self.events.send(envelope);
        Ok(true)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageEnvelope>> {
        self.gate_read().await?;
        let mut messages = self
            .state
            .read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn count_unread(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        self.gate_read().await?;
        let state = self.state.read();
        let count = state
            .messages
            .get(conversation_id)
            .map(|msgs| msgs.iter().filter(|m| !m.is_read && !m.is_from(reader_id)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        self.gate_write().await?;
        let mut state = self.state.write();
        let mut changed = 0;
        if let Some(msgs) = state.messages.get_mut(conversation_id) {
            for msg in msgs.iter_mut().filter(|m| !m.is_read && !m.is_from(reader_id)) {
                msg.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<bool> {
        self.gate_write().await?;
        let mut state = self.state.write();
        for msgs in state.messages.values_mut() {
            if let Some(msg) = msgs.iter_mut().find(|m| m.id == message_id) {
                let changed = !msg.is_read;
                msg.is_read = true;
                return Ok(changed);
            }
        }
        Ok(false)
    }

    async fn subscribe_messages(&self, conversation_id: &str) -> Result<Subscription> {
        self.gate_read().await?;
        Ok(Subscription::new(conversation_id, self.events.subscribe()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
