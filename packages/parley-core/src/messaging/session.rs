//! # Messaging Session
//!
//! Orchestrates conversations for the signed-in user.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SEND PATH                                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  send_message(conversation, plaintext, recipient)                      │
//! │    │                                                                    │
//! │    ├─ vault ready?                  no → EncryptionNotReady            │
//! │    ├─ content non-empty, ≤ limit?   no → InvalidMessageContent         │
//! │    ├─ caller and recipient in it?   no → ConversationNotFound /        │
//! │    │                                     InvalidMessageContent          │
//! │    ├─ recipient key published?      no → RecipientKeyMissing           │
//! │    ├─ encrypt_for_recipient         fail → EncryptionFailed            │
//! │    ├─ insert_message + touch conversation                              │
//! │    │     inserted                  → Sent(entry), touch failure logged │
//! │    │     recoverable, offline      → outbox, Queued(entry)             │
//! │    │     otherwise                 → error                             │
//! │    └─ entry carries the plaintext; no decrypt round-trip               │
//! │                                                                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                        READ PATH                                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  fetch_messages(conversation)                                          │
//! │    envelopes oldest first, decrypted one at a time:                    │
//! │      sender_id == me → encrypted_key_sender                            │
//! │      otherwise       → encrypted_key_receiver                          │
//! │      failure         → "[Unable to decrypt]"                           │
//! │    then one background mark-read for the peer's unread messages        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::cipher::MessageCipher;
use super::outbox::{Outbox, OutboxWorker};
use super::transcript::{ConversationSummary, TranscriptEntry};
use super::view::ConversationView;
use super::{MessageEnvelope, MessageType};
use crate::config::MessagingConfig;
use crate::error::{Error, Result};
use crate::storage::{with_timeout, Backend, Conversation};
use crate::time::now_timestamp_millis;
use crate::vault::KeyVault;

// ============================================================================
// CONNECTIVITY
// ============================================================================

/// Reports whether the device currently has a network path to the store
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// `Connectivity` driven by whoever owns the flag
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    /// Create a flag starting `online` or offline
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    /// Record a connectivity change
    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// SEND OUTCOME
// ============================================================================

/// Result of a successful `send_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stored in the backend
    Sent(TranscriptEntry),
    /// Encrypted and held in the outbox until the store is reachable
    Queued(TranscriptEntry),
}

impl SendOutcome {
    /// The optimistic transcript entry, either way
    pub fn entry(&self) -> &TranscriptEntry {
        match self {
            SendOutcome::Sent(entry) | SendOutcome::Queued(entry) => entry,
        }
    }

    /// Take the entry, either way
    pub fn into_entry(self) -> TranscriptEntry {
        match self {
            SendOutcome::Sent(entry) | SendOutcome::Queued(entry) => entry,
        }
    }

    /// Whether the envelope is waiting in the outbox
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued(_))
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Decrypt one envelope for `user_id`, falling back to `placeholder`
pub(crate) fn open_envelope(
    cipher: &MessageCipher,
    envelope: &MessageEnvelope,
    user_id: &str,
    placeholder: &str,
) -> TranscriptEntry {
    let plaintext = cipher.decrypt_received_message(
        &envelope.encrypted_content,
        envelope.key_for(user_id),
        &envelope.nonce,
    );
    let decrypted = plaintext.is_some();
    if !decrypted {
        tracing::warn!("Message {} could not be decrypted", envelope.id);
    }

    TranscriptEntry {
        id: envelope.id.clone(),
        conversation_id: envelope.conversation_id.clone(),
        sender_id: envelope.sender_id.clone(),
        content: plaintext.unwrap_or_else(|| placeholder.to_string()),
        message_type: envelope.message_type,
        is_read: envelope.is_read,
        created_at: envelope.created_at,
        is_outgoing: envelope.is_from(user_id),
        decrypted,
    }
}

/// Messaging for the signed-in user
pub struct MessagingSession {
    backend: Arc<dyn Backend>,
    vault: Arc<KeyVault>,
    connectivity: Arc<dyn Connectivity>,
    outbox: Arc<Outbox>,
    config: MessagingConfig,
    /// One async lock per conversation, serializing sends
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MessagingSession {
    /// Session over `backend`, sending as whoever `vault` is activated for
    pub fn new(
        backend: Arc<dyn Backend>,
        vault: Arc<KeyVault>,
        connectivity: Arc<dyn Connectivity>,
        outbox: Arc<Outbox>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            backend,
            vault,
            connectivity,
            outbox,
            config,
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The key vault this session encrypts with
    pub fn vault(&self) -> &Arc<KeyVault> {
        &self.vault
    }

    /// The offline send queue
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Tunables this session runs with
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Conversations involving the user, newest activity first
    pub async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let user_id = self.user_id()?;
        let conversations = self
            .timed("list_conversations", self.backend.list_conversations(&user_id))
            .await?;

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let peer_id = conversation.other_participant(&user_id).to_string();
            let peer = self.timed("get_profile", self.backend.get_profile(&peer_id)).await?;
            let unread_count = self
                .timed("count_unread", self.backend.count_unread(&conversation.id, &user_id))
                .await?;
            summaries.push(ConversationSummary {
                conversation,
                peer_id,
                peer,
                unread_count,
            });
        }
        Ok(summaries)
    }

    /// Decrypted history of one conversation, oldest first
    ///
    /// Marks the peer's unread messages read in the background; that step
    /// never fails this call.
    pub async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>> {
        let user_id = self.user_id()?;
        let cipher = self.cipher()?;
        self.require_participant(conversation_id, &user_id).await?;

        let envelopes = self
            .timed("list_messages", self.backend.list_messages(conversation_id))
            .await?;

        let placeholder = &self.config.undecryptable_placeholder;
        let entries: Vec<TranscriptEntry> = envelopes
            .iter()
            .map(|envelope| open_envelope(&cipher, envelope, &user_id, placeholder))
            .collect();

        if envelopes.iter().any(|e| !e.is_read && !e.is_from(&user_id)) {
            self.mark_read_in_background(conversation_id, &user_id);
        }

        tracing::debug!("Fetched {} message(s) for {}", entries.len(), conversation_id);
        Ok(entries)
    }

    /// Encrypt and send a text message
    pub async fn send_message(&self, conversation_id: &str, plaintext: &str, recipient_id: &str) -> Result<SendOutcome> {
        self.send_message_with_type(conversation_id, plaintext, recipient_id, MessageType::Text)
            .await
    }

    /// Encrypt and send a message of any type
    pub async fn send_message_with_type(
        &self,
        conversation_id: &str,
        plaintext: &str,
        recipient_id: &str,
        message_type: MessageType,
    ) -> Result<SendOutcome> {
        let cipher = self.cipher()?;
        let user_id = self.user_id()?;
        self.validate_content(plaintext)?;

        let lock = self.send_lock(conversation_id);
        let _serial = lock.lock().await;

        let conversation = self.require_participant(conversation_id, &user_id).await?;
        if conversation.other_participant(&user_id) != recipient_id {
            return Err(Error::InvalidMessageContent(format!(
                "{} is not the other participant of {}",
                recipient_id, conversation_id
            )));
        }

        let recipient_key = self
            .vault
            .get_recipient_public_key(recipient_id)
            .await?
            .ok_or(Error::RecipientKeyMissing)?;

        let payload = cipher
            .encrypt_for_recipient(plaintext, &recipient_key)
            .ok_or(Error::EncryptionFailed)?;

        let envelope = MessageEnvelope {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: user_id.clone(),
            encrypted_content: payload.encrypted_content,
            encrypted_key_sender: payload.encrypted_key_for_sender,
            encrypted_key_receiver: payload.encrypted_key_for_receiver,
            nonce: payload.nonce,
            message_type,
            is_read: false,
            created_at: now_timestamp_millis(),
        };

        let entry = TranscriptEntry {
            id: envelope.id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            sender_id: user_id,
            content: plaintext.to_string(),
            message_type,
            is_read: false,
            created_at: envelope.created_at,
            is_outgoing: true,
            decrypted: true,
        };

        match self.persist(envelope.clone()).await {
            Ok(()) => {
                tracing::debug!("Message {} sent", entry.id);
                Ok(SendOutcome::Sent(entry))
            }
            Err(e) if e.is_recoverable() && !self.connectivity.is_online() => {
                tracing::warn!("Store unreachable while offline, queueing {}: {}", entry.id, e);
                self.outbox.enqueue(envelope)?;
                Ok(SendOutcome::Queued(entry))
            }
            Err(e) => Err(e),
        }
    }

    /// The conversation id for the user and `other_user_id`, created on demand
    pub async fn get_or_create_conversation(&self, other_user_id: &str) -> Result<String> {
        let user_id = self.user_id()?;
        if other_user_id == user_id {
            return Err(Error::InvalidMessageContent("cannot start a conversation with yourself".into()));
        }
        let conversation = self
            .timed(
                "get_or_create_conversation",
                self.backend.get_or_create_conversation(&user_id, other_user_id),
            )
            .await?;
        Ok(conversation.id)
    }

    /// Open a conversation with live updates
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationView> {
        let user_id = self.user_id()?;
        let cipher = self.cipher()?;

        let mut view = ConversationView::new(
            conversation_id,
            &user_id,
            cipher,
            Arc::clone(&self.backend),
            self.config.clone(),
        );

        // Subscribe before loading so nothing inserted during the load is lost.
        let subscription = self
            .timed("subscribe_messages", self.backend.subscribe_messages(conversation_id))
            .await?;
        let history = self.fetch_messages(conversation_id).await?;

        view.start(subscription, history);
        Ok(view)
    }

    /// One delivery pass over the outbox
    ///
    /// Fails with `NotConnected` while connectivity reports offline.
    pub async fn flush_outbox(&self) -> Result<usize> {
        if !self.connectivity.is_online() {
            return Err(Error::NotConnected);
        }
        self.outbox.flush(self.backend.as_ref()).await
    }

    /// Flush the outbox periodically while online
    pub fn spawn_outbox_worker(&self) -> OutboxWorker {
        self.outbox.spawn_worker(
            Arc::clone(&self.backend),
            Arc::clone(&self.connectivity),
            self.config.outbox_flush_interval(),
        )
    }

    // ------------------------------------------------------------------------

    fn user_id(&self) -> Result<String> {
        self.vault.user_id().ok_or(Error::EncryptionNotReady)
    }

    fn cipher(&self) -> Result<MessageCipher> {
        self.vault
            .keypair()
            .map(MessageCipher::new)
            .ok_or(Error::EncryptionNotReady)
    }

    fn validate_content(&self, plaintext: &str) -> Result<()> {
        if plaintext.trim().is_empty() {
            return Err(Error::InvalidMessageContent("message is empty".into()));
        }
        if plaintext.len() > self.config.max_message_bytes {
            return Err(Error::InvalidMessageContent(format!(
                "message exceeds {} bytes",
                self.config.max_message_bytes
            )));
        }
        Ok(())
    }

    async fn require_participant(&self, conversation_id: &str, user_id: &str) -> Result<Conversation> {
        let conversation = self
            .timed("get_conversation", self.backend.get_conversation(conversation_id))
            .await?
            .ok_or(Error::ConversationNotFound)?;
        if !conversation.involves(user_id) {
            return Err(Error::ConversationNotFound);
        }
        Ok(conversation)
    }

    /// Insert, then touch the conversation
    ///
    /// A failed touch after a successful insert is logged, not returned.
    async fn persist(&self, envelope: MessageEnvelope) -> Result<()> {
        let conversation_id = envelope.conversation_id.clone();
        let created_at = envelope.created_at;
        self.timed("insert_message", self.backend.insert_message(envelope))
            .await?;
        if let Err(e) = self
            .timed(
                "touch_conversation",
                self.backend.touch_conversation(&conversation_id, created_at),
            )
            .await
        {
            tracing::warn!("Failed to touch conversation {}: {}", conversation_id, e);
        }
        Ok(())
    }

    fn mark_read_in_background(&self, conversation_id: &str, user_id: &str) {
        let backend = Arc::clone(&self.backend);
        let timeout = self.config.store_timeout();
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let result = with_timeout(
                timeout,
                "mark_conversation_read",
                backend.mark_conversation_read(&conversation_id, &user_id),
            )
            .await;
            match result {
                Ok(count) => tracing::debug!("Marked {} message(s) read in {}", count, conversation_id),
                Err(e) => tracing::warn!("Failed to mark {} read: {}", conversation_id, e),
            }
        });
    }

    fn send_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.send_locks
                .lock()
                .entry(conversation_id.to_string())
                .or_default(),
        )
    }

    async fn timed<T>(
        &self,
        operation: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(self.config.store_timeout(), operation, call).await
    }
}

impl std::fmt::Debug for MessagingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingSession")
            .field("vault", &self.vault)
            .field("online", &self.connectivity.is_online())
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
