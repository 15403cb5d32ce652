//! # Outbox
//!
//! Durable queue for envelopes that were encrypted while the store was
//! unreachable.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           OUTBOX LOG                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  outbox.jsonl (append-only, one JSON record per line)                  │
//! │  ─────────────────────────────────────────────                          │
//! │  {"op":"enqueue","entry":{"envelope":{...},"attempts":0,...}}          │
//! │  {"op":"enqueue","entry":{...}}                                        │
//! │  {"op":"ack","id":"<message id>"}                                      │
//! │                                                                         │
//! │  open()    replay: pending = enqueued − acked                          │
//! │  flush()   insert_message (idempotent) → touch → append ack            │
//! │            recoverable failure → attempts += 1, retry after            │
//! │                                  min(base × 2^attempts, max)           │
//! │            permanent failure   → append ack, entry dropped             │
//! │            queue drained       → compact()                             │
//! │  compact() rewrite the log with pending entries only                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only ciphertext is written to disk. Attempt counters live in memory and
//! restart at zero after a reopen.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::session::Connectivity;
use super::MessageEnvelope;
use crate::config::MessagingConfig;
use crate::error::{Error, Result};
use crate::storage::{with_timeout, Backend};
use crate::time::now_timestamp_millis;

/// One queued envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub envelope: MessageEnvelope,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Unix milliseconds before which the entry is not retried
    pub next_attempt_at: i64,
    /// Unix milliseconds
    pub enqueued_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Enqueue { entry: OutboxEntry },
    Ack { id: String },
}

/// Durable offline send queue
pub struct Outbox {
    path: Option<PathBuf>,
    pending: Mutex<Vec<OutboxEntry>>,
    /// Held across a log write and the matching `pending` update
    log: Mutex<()>,
    /// Serializes flush passes
    flushing: tokio::sync::Mutex<()>,
    base_delay: Duration,
    max_delay: Duration,
    store_timeout: Duration,
}

impl Outbox {
    /// Open the outbox at `config.outbox_path`, replaying any existing log
    pub fn open(config: &MessagingConfig) -> Result<Self> {
        let mut outbox = Self::in_memory(config);
        if let Some(path) = &config.outbox_path {
            let pending = replay(path)?;
            if !pending.is_empty() {
                tracing::info!("Outbox replayed {} pending message(s)", pending.len());
            }
            *outbox.pending.get_mut() = pending;
            outbox.path = Some(path.clone());
        }
        Ok(outbox)
    }

    /// An outbox that forgets its contents when dropped
    pub fn in_memory(config: &MessagingConfig) -> Self {
        Self {
            path: None,
            pending: Mutex::new(Vec::new()),
            log: Mutex::new(()),
            flushing: tokio::sync::Mutex::new(()),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            store_timeout: config.store_timeout(),
        }
    }

    /// Queue an envelope; a second enqueue of the same id is a no-op
    pub fn enqueue(&self, envelope: MessageEnvelope) -> Result<()> {
        let _log = self.log.lock();
        if self.contains(&envelope.id) {
            return Ok(());
        }
        let now = now_timestamp_millis();
        let entry = OutboxEntry {
            envelope,
            attempts: 0,
            next_attempt_at: now,
            enqueued_at: now,
        };
        self.append(&LogRecord::Enqueue { entry: entry.clone() })?;
        tracing::debug!("Outbox queued message {}", entry.envelope.id);
        self.pending.lock().push(entry);
        Ok(())
    }

    /// Remove a delivered entry
    pub fn ack(&self, id: &str) -> Result<()> {
        let _log = self.log.lock();
        self.append(&LogRecord::Ack { id: id.to_string() })?;
        self.pending.lock().retain(|e| e.envelope.id != id);
        Ok(())
    }

    /// Snapshot of queued entries, oldest first
    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.pending.lock().clone()
    }

    /// Whether message `id` is still queued
    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().iter().any(|e| e.envelope.id == id)
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Rewrite the log so it holds only pending entries
    pub fn compact(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _log = self.log.lock();
        let pending = self.pending.lock().clone();

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in pending {
                let line = serde_json::to_string(&LogRecord::Enqueue { entry })?;
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!("Outbox log compacted");
        Ok(())
    }

    /// One delivery pass over every due entry
    ///
    /// Returns how many entries were delivered.
    pub async fn flush(&self, backend: &dyn Backend) -> Result<usize> {
        let _pass = self.flushing.lock().await;

        let now = now_timestamp_millis();
        let due: Vec<OutboxEntry> = self
            .pending
            .lock()
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect();

        let mut delivered = 0;
        let mut settled = 0;
        for entry in due {
            let id = entry.envelope.id.clone();
            match self.deliver(backend, entry.envelope).await {
                Ok(()) => {
                    self.ack(&id)?;
                    delivered += 1;
                    settled += 1;
                }
                Err(e) if !e.is_recoverable() => {
                    tracing::warn!("Outbox dropping {}, delivery cannot succeed: {}", id, e);
                    self.ack(&id)?;
                    settled += 1;
                }
                Err(e) => {
                    let delay = self.backoff_delay(entry.attempts);
                    tracing::warn!("Outbox delivery of {} failed, retrying in {:?}: {}", id, delay, e);
                    let mut pending = self.pending.lock();
                    if let Some(slot) = pending.iter_mut().find(|p| p.envelope.id == id) {
                        slot.attempts = slot.attempts.saturating_add(1);
                        slot.next_attempt_at = now_timestamp_millis() + delay.as_millis() as i64;
                    }
                }
            }
        }

        if delivered > 0 {
            tracing::info!("Outbox flushed {} message(s), {} pending", delivered, self.len());
        }
        if settled > 0 && self.is_empty() {
            self.compact()?;
        }
        Ok(delivered)
    }

    /// Retry delay after `attempts` earlier failures
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run flush passes every `interval` while online
    ///
    /// The worker stops when the returned handle is dropped.
    pub fn spawn_worker(
        self: &Arc<Self>,
        backend: Arc<dyn Backend>,
        connectivity: Arc<dyn Connectivity>,
        interval: Duration,
    ) -> OutboxWorker {
        let outbox = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if outbox.is_empty() || !connectivity.is_online() {
                    continue;
                }
                if let Err(e) = outbox.flush(backend.as_ref()).await {
                    tracing::warn!("Outbox flush pass failed: {}", e);
                }
            }
        });
        OutboxWorker { handle }
    }

    async fn deliver(&self, backend: &dyn Backend, envelope: MessageEnvelope) -> Result<()> {
        let conversation_id = envelope.conversation_id.clone();
        let created_at = envelope.created_at;
        with_timeout(self.store_timeout, "insert_message", backend.insert_message(envelope)).await?;
        let touched = with_timeout(
            self.store_timeout,
            "touch_conversation",
            backend.touch_conversation(&conversation_id, created_at),
        )
        .await;
        if let Err(e) = touched {
            tracing::warn!("Failed to touch conversation {}: {}", conversation_id, e);
        }
        Ok(())
    }

    /// Caller holds `log`
    fn append(&self, record: &LogRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("path", &self.path)
            .field("pending", &self.len())
            .finish()
    }
}

/// Background flush task; aborted on drop
#[derive(Debug)]
pub struct OutboxWorker {
    handle: JoinHandle<()>,
}

impl OutboxWorker {
    /// Stop the worker now
    pub fn stop(self) {}
}

impl Drop for OutboxWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn replay(path: &Path) -> Result<Vec<OutboxEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::StorageReadError(e.to_string())),
    };

    let mut pending: Vec<OutboxEntry> = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::StorageReadError(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(LogRecord::Enqueue { entry }) => {
                if !pending.iter().any(|p| p.envelope.id == entry.envelope.id) {
                    pending.push(OutboxEntry {
                        attempts: 0,
                        ..entry
                    });
                }
            }
            Ok(LogRecord::Ack { id }) => pending.retain(|p| p.envelope.id != id),
            // A crash mid-append leaves a torn final line.
            Err(e) => tracing::warn!("Skipping unreadable outbox line {}: {}", n + 1, e),
        }
    }
    Ok(pending)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageType;
    use crate::storage::MemoryBackend;

    fn config(path: Option<PathBuf>) -> MessagingConfig {
        MessagingConfig {
            outbox_path: path,
            retry_base_delay_ms: 0,
            ..MessagingConfig::fast()
        }
    }

    fn envelope(id: &str, conversation_id: &str) -> MessageEnvelope {
        MessageEnvelope {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: "alice".into(),
            encrypted_content: "ct".into(),
            encrypted_key_sender: "ks".into(),
            encrypted_key_receiver: "kr".into(),
            nonce: "n".into(),
            message_type: MessageType::Text,
            is_read: false,
            created_at: 42,
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let outbox = Outbox::in_memory(&config(None));
        outbox.enqueue(envelope("m1", "c")).unwrap();
        outbox.enqueue(envelope("m1", "c")).unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(Some(dir.path().join("outbox.jsonl")));
        {
            let outbox = Outbox::open(&cfg).unwrap();
            outbox.enqueue(envelope("m1", "c")).unwrap();
            outbox.enqueue(envelope("m2", "c")).unwrap();
            outbox.ack("m1").unwrap();
        }
        let reopened = Outbox::open(&cfg).unwrap();
        let ids: Vec<_> = reopened.pending().into_iter().map(|e| e.envelope.id).collect();
        assert_eq!(ids, vec!["m2"]);
    }

    #[test]
    fn test_replay_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let cfg = config(Some(path.clone()));
        {
            let outbox = Outbox::open(&cfg).unwrap();
            outbox.enqueue(envelope("m1", "c")).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"op\":\"enq").unwrap();
        drop(file);

        let reopened = Outbox::open(&cfg).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_compact_keeps_only_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let cfg = config(Some(path.clone()));
        let outbox = Outbox::open(&cfg).unwrap();
        for id in ["m1", "m2", "m3"] {
            outbox.enqueue(envelope(id, "c")).unwrap();
        }
        outbox.ack("m1").unwrap();
        outbox.ack("m3").unwrap();
        outbox.compact().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("m2"));
        assert_eq!(Outbox::open(&cfg).unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let cfg = MessagingConfig {
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            ..MessagingConfig::default()
        };
        let outbox = Outbox::in_memory(&cfg);
        assert_eq!(outbox.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(outbox.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(outbox.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(outbox.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(outbox.backoff_delay(64), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_flush_delivers_and_acks() {
        let backend = MemoryBackend::default();
        let conv = backend.get_or_create_conversation("alice", "bob").await.unwrap();
        let outbox = Outbox::in_memory(&config(None));
        outbox.enqueue(envelope("m1", &conv.id)).unwrap();

        assert_eq!(outbox.flush(&backend).await.unwrap(), 1);
        assert!(outbox.is_empty());
        assert_eq!(backend.message_count(), 1);
        let conv = backend.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.last_message_at, Some(42));
    }

    #[tokio::test]
    async fn test_failed_flush_schedules_retry() {
        let backend = MemoryBackend::default();
        let conv = backend.get_or_create_conversation("alice", "bob").await.unwrap();
        let cfg = MessagingConfig {
            retry_base_delay_ms: 60_000,
            retry_max_delay_ms: 120_000,
            ..MessagingConfig::fast()
        };
        let outbox = Outbox::in_memory(&cfg);
        outbox.enqueue(envelope("m1", &conv.id)).unwrap();

        backend.set_failing(true);
        assert_eq!(outbox.flush(&backend).await.unwrap(), 0);
        let entry = outbox.pending().remove(0);
        assert_eq!(entry.attempts, 1);
        assert!(entry.next_attempt_at > now_timestamp_millis());

        // Not due yet, so nothing is attempted even once the store is back.
        backend.set_failing(false);
        assert_eq!(outbox.flush(&backend).await.unwrap(), 0);
        assert_eq!(backend.message_count(), 0);
    }

    #[test]
    fn test_enqueue_survives_concurrent_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(Some(dir.path().join("outbox.jsonl")));
        let outbox = Arc::new(Outbox::open(&cfg).unwrap());

        let compactor = {
            let outbox = Arc::clone(&outbox);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    outbox.compact().unwrap();
                }
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let outbox = Arc::clone(&outbox);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("m{}-{}", t, i);
                        outbox.enqueue(envelope(&id, "c")).unwrap();
                        if i % 2 == 0 {
                            outbox.ack(&id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        compactor.join().unwrap();

        let mut expected: Vec<_> = outbox.pending().into_iter().map(|e| e.envelope.id).collect();
        let mut replayed: Vec<_> = Outbox::open(&cfg)
            .unwrap()
            .pending()
            .into_iter()
            .map(|e| e.envelope.id)
            .collect();
        expected.sort();
        replayed.sort();
        assert_eq!(expected.len(), 48);
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn test_flush_drops_undeliverable_entry() {
        let backend = MemoryBackend::default();
        let conv = backend.get_or_create_conversation("alice", "bob").await.unwrap();
        let outbox = Outbox::in_memory(&config(None));
        outbox.enqueue(envelope("orphan", "no-such-conversation")).unwrap();
        outbox.enqueue(envelope("m1", &conv.id)).unwrap();

        assert_eq!(outbox.flush(&backend).await.unwrap(), 1);
        assert!(outbox.is_empty());
        assert_eq!(backend.message_count(), 1);
    }

    #[tokio::test]
    async fn test_drained_flush_compacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let cfg = config(Some(path.clone()));
        let backend = MemoryBackend::default();
        let conv = backend.get_or_create_conversation("alice", "bob").await.unwrap();

        let outbox = Outbox::open(&cfg).unwrap();
        outbox.enqueue(envelope("m1", &conv.id)).unwrap();
        outbox.enqueue(envelope("m2", &conv.id)).unwrap();
        assert_eq!(outbox.flush(&backend).await.unwrap(), 2);

        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 0);
        assert!(Outbox::open(&cfg).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_harmless() {
        let backend = MemoryBackend::default();
        let conv = backend.get_or_create_conversation("alice", "bob").await.unwrap();
        backend.insert_message(envelope("m1", &conv.id)).await.unwrap();

        let outbox = Outbox::in_memory(&config(None));
        outbox.enqueue(envelope("m1", &conv.id)).unwrap();
        assert_eq!(outbox.flush(&backend).await.unwrap(), 1);
        assert_eq!(backend.message_count(), 1);
    }
}
