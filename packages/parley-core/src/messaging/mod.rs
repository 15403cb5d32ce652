//! # Messaging Module
//!
//! End-to-end encrypted direct messages.
//!
//! ## Envelope Encryption
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ENCRYPTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender (Alice) → Recipient (Bob)                                      │
//! │                                                                         │
//! │  1. Fresh message key                                                  │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  K = 32 random bytes                                         │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  2. Encrypt body once                                                  │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  encrypted_content = AES-256-GCM(K, nonce, "Hello Bob!")    │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  3. Wrap K twice                                                       │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  encrypted_key_receiver = seal(K, bob_public)               │       │
//! │  │  encrypted_key_sender   = seal(K, alice_public)             │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Reading picks the wrap that matches the reader:                       │
//! │    sender_id == me  → encrypted_key_sender                             │
//! │    otherwise        → encrypted_key_receiver                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Envelope Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ENVELOPE FORMAT                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {                                                                      │
//! │    "id": "uuid-v4",                                                     │
//! │    "conversation_id": "uuid-v4",                                        │
//! │    "sender_id": "...",                                                  │
//! │    "encrypted_content": "base64...",   // AES-GCM ciphertext + tag     │
//! │    "encrypted_key_sender": "base64...",                                 │
//! │    "encrypted_key_receiver": "base64...",                               │
//! │    "nonce": "base64...",               // 12 bytes                     │
//! │    "message_type": "text",             // text | image | file          │
//! │    "is_read": false,                                                    │
//! │    "created_at": 1700000000000         // Unix ms                      │
//! │  }                                                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod cipher;
mod outbox;
mod session;
mod transcript;
mod view;

pub use cipher::{EncryptedPayload, MessageCipher};
pub use outbox::{Outbox, OutboxEntry, OutboxWorker};
pub use session::{Connectivity, ConnectivityFlag, MessagingSession, SendOutcome};
pub use transcript::{ConversationSummary, TranscriptEntry};
pub use view::{ConversationView, ViewState};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind of content carried by a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text
    #[default]
    Text,
    /// Image reference
    Image,
    /// File reference
    File,
}

impl MessageType {
    /// Lowercase name used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "file" => Ok(MessageType::File),
            other => Err(Error::SerializationError(format!("unknown message type: {}", other))),
        }
    }
}

/// A stored, encrypted message
///
/// Immutable once written except for `is_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Author's user id
    pub sender_id: String,
    /// base64 AES-256-GCM ciphertext with tag
    pub encrypted_content: String,
    /// Message key wrapped for the author
    pub encrypted_key_sender: String,
    /// Message key wrapped for the other participant
    pub encrypted_key_receiver: String,
    /// base64 12-byte nonce
    pub nonce: String,
    pub message_type: MessageType,
    pub is_read: bool,
    /// Unix milliseconds
    pub created_at: i64,
}

impl MessageEnvelope {
    /// The wrapped key `reader_id` can open
    pub fn key_for(&self, reader_id: &str) -> &str {
        if self.sender_id == reader_id {
            &self.encrypted_key_sender
        } else {
            &self.encrypted_key_receiver
        }
    }

    /// Whether `user_id` wrote this message
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(sender: &str) -> MessageEnvelope {
        MessageEnvelope {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            encrypted_content: "content".into(),
            encrypted_key_sender: "for-sender".into(),
            encrypted_key_receiver: "for-receiver".into(),
            nonce: "nonce".into(),
            message_type: MessageType::Text,
            is_read: false,
            created_at: 1,
        }
    }

    #[test]
    fn test_key_selection_by_direction() {
        let env = envelope("alice");
        assert_eq!(env.key_for("alice"), "for-sender");
        assert_eq!(env.key_for("bob"), "for-receiver");
    }

    #[test]
    fn test_message_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MessageType::Image).unwrap(), "\"image\"");
        let parsed: MessageType = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(parsed, MessageType::File);
        assert_eq!("text".parse::<MessageType>().unwrap(), MessageType::Text);
        assert!("video".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_envelope_json_shape() {
        let json = serde_json::to_value(envelope("alice")).unwrap();
        assert_eq!(json["message_type"], "text");
        assert_eq!(json["is_read"], false);
        assert_eq!(json["created_at"], 1);
    }
}
