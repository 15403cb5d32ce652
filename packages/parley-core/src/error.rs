//! # Error Handling
//!
//! Error types for Parley Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Core Errors                                                       │
//! │  │   └── InvalidConfig         - Configuration rejected                │
//! │  │                                                                      │
//! │  ├── Vault Errors                                                      │
//! │  │   ├── EncryptionNotReady    - Keys not loaded yet                   │
//! │  │   ├── RecipientKeyMissing   - Peer never set up messaging           │
//! │  │   └── KeyRecordExists       - Key record already stored             │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncodingError         - Malformed key/blob string             │
//! │  │   ├── DecryptionError       - Unwrap or decrypt failed              │
//! │  │   ├── EncryptionFailed      - Unexpected cipher failure             │
//! │  │   └── KeyDerivationFailed   - KDF rejected its inputs               │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError      - Failed to read from the store         │
//! │  │   ├── StorageWriteError     - Failed to write to the store          │
//! │  │   ├── StorageNotFound       - Row not found                         │
//! │  │   └── DatabaseError         - SQLite error                          │
//! │  │                                                                      │
//! │  ├── Network Errors                                                    │
//! │  │   ├── NotConnected          - Offline                               │
//! │  │   └── Timeout               - Operation timed out                   │
//! │  │                                                                      │
//! │  └── Message Errors                                                    │
//! │      ├── ConversationNotFound  - Conversation doesn't exist            │
//! │      └── InvalidMessageContent - Empty, oversized or self-addressed    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Crypto variants never carry the underlying primitive's error text. A
//! wrong password, a wrong salt and a corrupted blob all surface as the same
//! `DecryptionError`.

use thiserror::Error;

/// Result type alias for Parley Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Parley Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Core Errors (100-199)
    // ========================================================================

    /// Configuration was rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Vault Errors (200-299)
    // ========================================================================

    /// Keys are not loaded yet (vault not `Ready`)
    #[error("Encryption keys are not ready yet.")]
    EncryptionNotReady,

    /// The peer has no stored key record
    #[error("Recipient has not set up encrypted messaging.")]
    RecipientKeyMissing,

    /// A key record already exists for this user
    #[error("A key record already exists for this user.")]
    KeyRecordExists,

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Malformed key or blob encoding
    #[error("Malformed key data: {0}")]
    EncodingError(String),

    /// Decryption failed
    #[error("Decryption failed")]
    DecryptionError,

    /// Encryption failed unexpectedly
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Item not found in storage
    #[error("Item not found: {0}")]
    StorageNotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// Not connected to the network
    #[error("Not connected to the network.")]
    NotConnected,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Message Errors (700-799)
    // ========================================================================

    /// Conversation not found
    #[error("Conversation not found.")]
    ConversationNotFound,

    /// Invalid message content
    #[error("Invalid message content: {0}")]
    InvalidMessageContent(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// - 100-199: Core
    /// - 200-299: Vault
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Network
    /// - 700-799: Messages
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidConfig(_) => 100,

            Error::EncryptionNotReady => 200,
            Error::RecipientKeyMissing => 201,
            Error::KeyRecordExists => 202,

            Error::EncodingError(_) => 300,
            Error::DecryptionError => 301,
            Error::EncryptionFailed => 302,
            Error::KeyDerivationFailed(_) => 303,

            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::StorageNotFound(_) => 402,
            Error::DatabaseError(_) => 403,

            Error::NotConnected => 500,
            Error::Timeout(_) => 501,

            Error::ConversationNotFound => 700,
            Error::InvalidMessageContent(_) => 701,

            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying, or by waiting for
    /// initialization to finish.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::NotConnected
                | Error::EncryptionNotReady
                | Error::StorageReadError(_)
                | Error::StorageWriteError(_)
        )
    }

    /// Generic, user-facing phrasing of this error
    ///
    /// Network and storage failures keep their detail in `Display` for
    /// logging; this is what a toast shows.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::EncryptionNotReady => "Encryption is still starting up. Try again in a moment.",
            Error::RecipientKeyMissing => "This person hasn't set up messaging yet.",
            Error::EncodingError(_) => "Corrupted key data.",
            Error::DecryptionError => "Unable to decrypt.",
            Error::EncryptionFailed => "Failed to encrypt the message.",
            Error::InvalidMessageContent(_) => "This message can't be sent.",
            Error::ConversationNotFound => "Conversation not found.",
            Error::Timeout(_) | Error::NotConnected => "You appear to be offline.",
            Error::StorageReadError(_) | Error::StorageNotFound(_) => "Failed to load messages.",
            Error::StorageWriteError(_) | Error::DatabaseError(_) => "Failed to send message.",
            _ => "Something went wrong.",
        }
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageWriteError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidConfig("x".into()).code(), 100);
        assert_eq!(Error::EncryptionNotReady.code(), 200);
        assert_eq!(Error::RecipientKeyMissing.code(), 201);
        assert_eq!(Error::DecryptionError.code(), 301);
        assert_eq!(Error::StorageWriteError("x".into()).code(), 401);
        assert_eq!(Error::Timeout("x".into()).code(), 501);
        assert_eq!(Error::ConversationNotFound.code(), 700);
        assert_eq!(Error::Internal("x".into()).code(), 900);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Timeout("slow".into()).is_recoverable());
        assert!(Error::EncryptionNotReady.is_recoverable());
        assert!(!Error::RecipientKeyMissing.is_recoverable());
        assert!(!Error::DecryptionError.is_recoverable());
    }

    #[test]
    fn test_crypto_errors_carry_no_detail() {
        assert_eq!(Error::DecryptionError.to_string(), "Decryption failed");
        assert_eq!(Error::EncryptionFailed.to_string(), "Encryption failed");
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            Error::RecipientKeyMissing.user_message(),
            "This person hasn't set up messaging yet."
        );
        assert_eq!(Error::EncodingError("bad".into()).user_message(), "Corrupted key data.");
        assert_eq!(
            Error::StorageReadError("timeout".into()).user_message(),
            "Failed to load messages."
        );
    }
}
