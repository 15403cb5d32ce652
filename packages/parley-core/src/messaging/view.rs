//! Realtime view of one open conversation.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CONVERSATION VIEW                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Closed ──open──► Loading ──history loaded──► Viewing ──close──► Closed│
//! │                                                                         │
//! │   1. subscribe to inserts            (events buffer in the receiver)   │
//! │   2. fetch + decrypt history         (seeds the seen-id set)           │
//! │   3. spawn listener task                                               │
//! │        own event        → ignored                                      │
//! │        already seen id  → ignored                                      │
//! │        otherwise        → decrypt, append, publish, mark read          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::cipher::MessageCipher;
use super::session::open_envelope;
use super::transcript::{Transcript, TranscriptEntry};
use super::MessageEnvelope;
use crate::config::MessagingConfig;
use crate::storage::{with_timeout, Backend, Subscription};

/// Lifecycle of a [`ConversationView`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Closed,
    Loading,
    Viewing,
}

/// Shared between the view handle and its listener task
struct Listener {
    conversation_id: String,
    user_id: String,
    cipher: MessageCipher,
    backend: Arc<dyn Backend>,
    config: MessagingConfig,
    transcript: Arc<Mutex<Transcript>>,
    updates: broadcast::Sender<TranscriptEntry>,
}

impl Listener {
    /// Reconcile one realtime insert with the transcript
    async fn apply(&self, envelope: MessageEnvelope) {
        if envelope.is_from(&self.user_id) {
            tracing::debug!("Ignoring own realtime event {}", envelope.id);
            return;
        }
        if self.transcript.lock().contains(&envelope.id) {
            tracing::debug!("Ignoring duplicate realtime event {}", envelope.id);
            return;
        }

        let entry = open_envelope(&self.cipher, &envelope, &self.user_id, &self.config.undecryptable_placeholder);
        if !self.transcript.lock().insert(entry.clone()) {
            return;
        }
        tracing::debug!("Realtime message {} appended", entry.id);
        let _ = self.updates.send(entry);

        let marked = with_timeout(
            self.config.store_timeout(),
            "mark_message_read",
            self.backend.mark_message_read(&envelope.id),
        )
        .await;
        if let Err(e) = marked {
            tracing::warn!("Failed to mark message {} read: {}", envelope.id, e);
        }
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription) {
        while let Some(envelope) = subscription.recv().await {
            self.apply(envelope).await;
        }
        tracing::debug!("Realtime feed for {} ended", self.conversation_id);
    }
}

/// An open conversation with live updates
pub struct ConversationView {
    listener: Arc<Listener>,
    state: RwLock<ViewState>,
    task: Option<JoinHandle<()>>,
}

impl ConversationView {
    pub(crate) fn new(
        conversation_id: &str,
        user_id: &str,
        cipher: MessageCipher,
        backend: Arc<dyn Backend>,
        config: MessagingConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.realtime_buffer.max(1));
        Self {
            listener: Arc::new(Listener {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                cipher,
                backend,
                config,
                transcript: Arc::new(Mutex::new(Transcript::default())),
                updates,
            }),
            state: RwLock::new(ViewState::Loading),
            task: None,
        }
    }

    /// Seed with history and start listening
    pub(crate) fn start(&mut self, subscription: Subscription, history: Vec<TranscriptEntry>) {
        {
            let mut transcript = self.listener.transcript.lock();
            for entry in history {
                transcript.insert(entry);
            }
        }
        let listener = Arc::clone(&self.listener);
        self.task = Some(tokio::spawn(listener.run(subscription)));
        *self.state.write() = ViewState::Viewing;
        tracing::info!("Conversation {} opened", self.listener.conversation_id);
    }

    /// The conversation this view follows
    pub fn conversation_id(&self) -> &str {
        &self.listener.conversation_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ViewState {
        *self.state.read()
    }

    /// Snapshot of the transcript, oldest first
    pub fn messages(&self) -> Vec<TranscriptEntry> {
        self.listener.transcript.lock().snapshot()
    }

    /// Number of entries in the transcript
    pub fn message_count(&self) -> usize {
        self.listener.transcript.lock().len()
    }

    /// Entries appended after this call
    pub fn updates(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.listener.updates.subscribe()
    }

    /// Add an optimistic local entry (e.g. a message just sent)
    ///
    /// Returns `false` if the id is already in the transcript.
    pub fn append_local(&self, entry: TranscriptEntry) -> bool {
        if !self.listener.transcript.lock().insert(entry.clone()) {
            return false;
        }
        let _ = self.listener.updates.send(entry);
        true
    }

    /// Stop listening and release the subscription
    ///
    /// Resolves once the listener task, and with it the subscription, is gone.
    pub async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            tracing::info!("Conversation {} closed", self.listener.conversation_id);
        }
        *self.state.write() = ViewState::Closed;
    }

    #[cfg(test)]
    pub(crate) async fn apply_event(&self, envelope: MessageEnvelope) {
        self.listener.apply(envelope).await;
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConversationView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationView")
            .field("conversation_id", &self.listener.conversation_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
