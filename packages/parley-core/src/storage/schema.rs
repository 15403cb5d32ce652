//! # Database Schema
//!
//! SQL schema definitions for the SQLite backend.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────┐   ┌─────────────────┐   ┌──────────────────┐  │
//! │  │    key_records      │   │  conversations  │   │    messages      │  │
//! │  ├─────────────────────┤   ├─────────────────┤   ├──────────────────┤  │
//! │  │ user_id (PK)        │   │ id (PK)         │◄──│ conversation_id  │  │
//! │  │ public_key          │   │ participant_one │   │ id (PK)          │  │
//! │  │ encrypted_priv_key  │   │ participant_two │   │ sender_id        │  │
//! │  │ key_salt            │   │ last_message_at │   │ encrypted_content│  │
//! │  │ created_at          │   │ created_at      │   │ encrypted_key_*  │  │
//! │  └─────────────────────┘   └─────────────────┘   │ nonce            │  │
//! │                                                  │ message_type     │  │
//! │  ┌─────────────────────┐                         │ is_read          │  │
//! │  │    profiles         │                         │ created_at       │  │
//! │  ├─────────────────────┤                         └──────────────────┘  │
//! │  │ user_id (PK)        │                                               │
//! │  │ username            │                                               │
//! │  │ display_name        │                                               │
//! │  │ avatar_url          │                                               │
//! │  └─────────────────────┘                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- One published key record per user, written once
CREATE TABLE IF NOT EXISTS key_records (
    user_id TEXT PRIMARY KEY,
    -- X25519 public key (base64)
    public_key TEXT NOT NULL,
    -- nonce || AES-256-GCM(secret) (base64)
    encrypted_private_key TEXT NOT NULL,
    -- Argon2id salt (base64)
    key_salt TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    display_name TEXT,
    avatar_url TEXT
);

-- Direct conversations; participants stored sorted
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    participant_one TEXT NOT NULL,
    participant_two TEXT NOT NULL,
    last_message_at INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE (participant_one, participant_two),
    CHECK (participant_one <= participant_two)
);
CREATE INDEX IF NOT EXISTS idx_conversations_one ON conversations(participant_one);
CREATE INDEX IF NOT EXISTS idx_conversations_two ON conversations(participant_two);

-- Encrypted message envelopes
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender_id TEXT NOT NULL,
    encrypted_content TEXT NOT NULL,
    encrypted_key_sender TEXT NOT NULL,
    encrypted_key_receiver TEXT NOT NULL,
    nonce TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text'
        CHECK (message_type IN ('text', 'image', 'file')),
    is_read INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
"#;
