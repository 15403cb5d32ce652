//! # SQLite Backend
//!
//! `Backend` over a local SQLite database.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │  dyn Backend    │  async trait calls                                │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │  SqliteBackend  │  - Key records, profiles                          │
//! │  │  (this file)    │  - Conversations (UNIQUE pair)                    │
//! │  │                 │  - Envelopes + realtime broadcast                 │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    rusqlite     │  - In-memory for tests                            │
//! │  │                 │  - File for local persistence                     │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Realtime notifications only reach subscribers attached to the same
//! `SqliteBackend` instance.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{schema, sorted_pair, Backend, Conversation, Profile, StoredKeyRecord, Subscription};
use crate::error::{Error, Result};
use crate::messaging::{MessageEnvelope, MessageType};
use crate::time::now_timestamp_millis;

const ENVELOPE_COLUMNS: &str = "id, conversation_id, sender_id, encrypted_content, \
     encrypted_key_sender, encrypted_key_receiver, nonce, message_type, is_read, created_at";

const CONVERSATION_COLUMNS: &str =
    "id, participant_one, participant_two, last_message_at, created_at";

/// The SQLite-backed store
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<MessageEnvelope>,
}

impl SqliteBackend {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database.
    pub fn open(path: Option<&Path>, realtime_buffer: usize) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory()
                .map_err(|e| Error::DatabaseError(format!("Failed to create in-memory database: {}", e)))?,
        };

        let (events, _) = broadcast::channel(realtime_buffer.max(1));
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::DatabaseError(format!("Failed to enable foreign keys: {}", e)))?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::DatabaseError(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    /// Number of live realtime subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

impl ToSql for MessageType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<MessageEnvelope> {
    Ok(MessageEnvelope {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        encrypted_content: row.get(3)?,
        encrypted_key_sender: row.get(4)?,
        encrypted_key_receiver: row.get(5)?,
        nonce: row.get(6)?,
        message_type: row.get(7)?,
        is_read: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_one: row.get(1)?,
        participant_two: row.get(2)?,
        last_message_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ============================================================================
// BACKEND
// ============================================================================

#[async_trait]
impl Backend for SqliteBackend {
    async fn get_key_record(&self, user_id: &str) -> Result<Option<StoredKeyRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, public_key, encrypted_private_key, key_salt, created_at
             FROM key_records WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok(StoredKeyRecord {
                    user_id: row.get(0)?,
                    public_key: row.get(1)?,
                    encrypted_private_key: row.get(2)?,
                    key_salt: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get key record: {}", e)))
    }

    async fn insert_key_record(&self, record: StoredKeyRecord) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO key_records
                 (user_id, public_key, encrypted_private_key, key_salt, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    record.user_id,
                    record.public_key,
                    record.encrypted_private_key,
                    record.key_salt,
                    record.created_at,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to insert key record: {}", e)))?;

        if rows == 0 {
            return Err(Error::KeyRecordExists);
        }
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, username, display_name, avatar_url FROM profiles WHERE user_id = ?",
            params![user_id],
            |row| {
                Ok(Profile {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    avatar_url: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get profile: {}", e)))
    }

    async fn upsert_profile(&self, profile: Profile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO profiles (user_id, username, display_name, avatar_url)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url",
            params![profile.user_id, profile.username, profile.display_name, profile.avatar_url],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to upsert profile: {}", e)))?;
        Ok(())
    }

    async fn get_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<Conversation> {
        let (one, two) = sorted_pair(user_a, user_b);
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "INSERT OR IGNORE INTO conversations
             (id, participant_one, participant_two, last_message_at, created_at)
             VALUES (?, ?, ?, NULL, ?)",
            params![Uuid::new_v4().to_string(), one, two, now_timestamp_millis()],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to create conversation: {}", e)))?;

        let conversation = tx
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE participant_one = ? AND participant_two = ?",
                    CONVERSATION_COLUMNS
                ),
                params![one, two],
                conversation_from_row,
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to get conversation: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit conversation: {}", e)))?;

        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS),
            params![conversation_id],
            conversation_from_row,
        )
        .optional()
        .map_err(|e| Error::DatabaseError(format!("Failed to get conversation: {}", e)))
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM conversations
                 WHERE participant_one = ?1 OR participant_two = ?1
                 ORDER BY last_message_at DESC NULLS LAST, created_at DESC",
                CONVERSATION_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![user_id], conversation_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query conversations: {}", e)))?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read conversation: {}", e)))?,
            );
        }

        Ok(conversations)
    }

    async fn touch_conversation(&self, conversation_id: &str, at: i64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE conversations
                 SET last_message_at = MAX(COALESCE(last_message_at, ?1), ?1)
                 WHERE id = ?2",
                params![at, conversation_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update conversation: {}", e)))?;

        if rows == 0 {
            return Err(Error::ConversationNotFound);
        }
        Ok(())
    }

    async fn insert_message(&self, envelope: MessageEnvelope) -> Result<bool> {
        let inserted = {
            let conn = self.conn.lock();

            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?)",
                    params![envelope.conversation_id],
                    |row| row.get(0),
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to check conversation: {}", e)))?;
            if !exists {
                return Err(Error::ConversationNotFound);
            }

            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO messages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    ENVELOPE_COLUMNS
                ),
                params![
                    envelope.id,
                    envelope.conversation_id,
                    envelope.sender_id,
                    envelope.encrypted_content,
                    envelope.encrypted_key_sender,
                    envelope.encrypted_key_receiver,
                    envelope.nonce,
                    envelope.message_type,
                    envelope.is_read,
                    envelope.created_at,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to store message: {}", e)))?
                > 0
        };

        if inserted {
            let _ = self.events.send(envelope);
        }
        Ok(inserted)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageEnvelope>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
                ENVELOPE_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![conversation_id], envelope_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
        }

        Ok(messages)
    }

    async fn count_unread(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ? AND sender_id != ? AND is_read = 0",
                params![conversation_id, reader_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to count unread: {}", e)))?;
        Ok(count as u64)
    }

    async fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ? AND sender_id != ? AND is_read = 0",
                params![conversation_id, reader_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark messages read: {}", e)))?;
        Ok(count as u64)
    }

    async fn mark_message_read(&self, message_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE messages SET is_read = 1 WHERE id = ? AND is_read = 0",
                params![message_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark read: {}", e)))?;
        Ok(rows > 0)
    }

    async fn subscribe_messages(&self, conversation_id: &str) -> Result<Subscription> {
        Ok(Subscription::new(conversation_id, self.events.subscribe()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SqliteBackend {
        SqliteBackend::open(None, 16).unwrap()
    }

    fn envelope(id: &str, conversation_id: &str, sender: &str, at: i64) -> MessageEnvelope {
        MessageEnvelope {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender.into(),
            encrypted_content: "ct".into(),
            encrypted_key_sender: "ks".into(),
            encrypted_key_receiver: "kr".into(),
            nonce: "n".into(),
            message_type: MessageType::Image,
            is_read: false,
            created_at: at,
        }
    }

    fn key_record(user_id: &str) -> StoredKeyRecord {
        StoredKeyRecord {
            user_id: user_id.into(),
            public_key: "pk".into(),
            encrypted_private_key: "epk".into(),
            key_salt: "salt".into(),
            created_at: 7,
        }
    }

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = backend();
        assert!(db.get_key_record("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_record_roundtrip_and_conflict() {
        let db = backend();
        db.insert_key_record(key_record("alice")).await.unwrap();
        assert_eq!(db.get_key_record("alice").await.unwrap(), Some(key_record("alice")));
        assert!(matches!(
            db.insert_key_record(key_record("alice")).await,
            Err(Error::KeyRecordExists)
        ));
    }

    #[tokio::test]
    async fn test_key_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");
        {
            let db = SqliteBackend::open(Some(&path), 16).unwrap();
            db.insert_key_record(key_record("alice")).await.unwrap();
        }
        let db = SqliteBackend::open(Some(&path), 16).unwrap();
        assert_eq!(db.get_key_record("alice").await.unwrap(), Some(key_record("alice")));
    }

    #[tokio::test]
    async fn test_conversation_pair_is_unique() {
        let db = backend();
        let c1 = db.get_or_create_conversation("bob", "alice").await.unwrap();
        let c2 = db.get_or_create_conversation("alice", "bob").await.unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1.participant_one, "alice");
        assert_eq!(db.list_conversations("alice").await.unwrap().len(), 1);
        assert!(db.list_conversations("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversations_ordered_by_activity() {
        let db = backend();
        let quiet = db.get_or_create_conversation("alice", "bob").await.unwrap();
        let busy = db.get_or_create_conversation("alice", "carol").await.unwrap();
        let idle = db.get_or_create_conversation("alice", "dave").await.unwrap();
        db.touch_conversation(&quiet.id, 10).await.unwrap();
        db.touch_conversation(&busy.id, 20).await.unwrap();

        let ids: Vec<_> = db
            .list_conversations("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![busy.id, quiet.id, idle.id]);
    }

    #[tokio::test]
    async fn test_message_storage() {
        let db = backend();
        let conv = db.get_or_create_conversation("alice", "bob").await.unwrap();
        let mut sub = db.subscribe_messages(&conv.id).await.unwrap();

        assert!(db.insert_message(envelope("m2", &conv.id, "bob", 20)).await.unwrap());
        assert!(db.insert_message(envelope("m1", &conv.id, "alice", 10)).await.unwrap());
        assert!(!db.insert_message(envelope("m1", &conv.id, "alice", 10)).await.unwrap());

        let messages = db.list_messages(&conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[1].message_type, MessageType::Image);

        assert_eq!(sub.recv().await.unwrap().id, "m2");
        assert_eq!(sub.recv().await.unwrap().id, "m1");
    }

    #[tokio::test]
    async fn test_message_requires_conversation() {
        let db = backend();
        let result = db.insert_message(envelope("m1", "missing", "alice", 1)).await;
        assert!(matches!(result, Err(Error::ConversationNotFound)));
    }

    #[tokio::test]
    async fn test_read_state() {
        let db = backend();
        let conv = db.get_or_create_conversation("alice", "bob").await.unwrap();
        db.insert_message(envelope("m1", &conv.id, "alice", 1)).await.unwrap();
        db.insert_message(envelope("m2", &conv.id, "bob", 2)).await.unwrap();
        db.insert_message(envelope("m3", &conv.id, "bob", 3)).await.unwrap();

        assert_eq!(db.count_unread(&conv.id, "alice").await.unwrap(), 2);
        assert!(db.mark_message_read("m2").await.unwrap());
        assert_eq!(db.mark_conversation_read(&conv.id, "alice").await.unwrap(), 1);
        assert_eq!(db.count_unread(&conv.id, "alice").await.unwrap(), 0);
        assert_eq!(db.count_unread(&conv.id, "bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_profile_upsert() {
        let db = backend();
        let mut profile = Profile {
            user_id: "bob".into(),
            username: "bob".into(),
            display_name: None,
            avatar_url: None,
        };
        db.upsert_profile(profile.clone()).await.unwrap();
        profile.display_name = Some("Bobby".into());
        db.upsert_profile(profile.clone()).await.unwrap();
        assert_eq!(db.get_profile("bob").await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn test_touch_missing_conversation() {
        let db = backend();
        assert!(matches!(
            db.touch_conversation("missing", 1).await,
            Err(Error::ConversationNotFound)
        ));
    }
}
