//! # Parley Core
//!
//! End-to-end encrypted direct messaging on top of a hosted store. The store
//! only ever sees ciphertext, wrapped keys and routing metadata.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PARLEY CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         Messaging                                 │  │
//! │  │  MessagingSession · ConversationView · MessageCipher · Outbox    │  │
//! │  └───────────┬──────────────────────────────┬───────────────────────┘  │
//! │              │                              │                          │
//! │  ┌───────────▼───────────┐      ┌───────────▼───────────┐              │
//! │  │        Vault          │      │        Storage        │              │
//! │  │                       │      │                       │              │
//! │  │ - Provision keypair   │─────►│ - Backend trait       │              │
//! │  │ - Unlock on sign-in   │      │ - SQLite / in-memory  │              │
//! │  │ - Recipient lookup    │      │ - Realtime inserts    │              │
//! │  └───────────┬───────────┘      └───────────────────────┘              │
//! │              │                                                          │
//! │  ┌───────────▼───────────┐                                             │
//! │  │        Crypto         │                                             │
//! │  │                       │                                             │
//! │  │ - X25519 keypairs     │                                             │
//! │  │ - AES-256-GCM         │                                             │
//! │  │ - Argon2id / HKDF     │                                             │
//! │  └───────────────────────┘                                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Tunables (timeouts, KDF cost, outbox retry)
//! - [`crypto`] - Keys, envelope encryption, private key export
//! - [`storage`] - The hosted store abstraction and its backends
//! - [`vault`] - Per-session keypair lifecycle
//! - [`messaging`] - Conversations, sending, realtime views, outbox
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Message Bodies (AES-256-GCM)                                 │
//! │  ─────────────────────────────────────                                  │
//! │  Every message gets a fresh random key and nonce.                      │
//! │                                                                         │
//! │  Layer 2: Key Wrapping (X25519 + HKDF + AES-256-GCM)                   │
//! │  ───────────────────────────────────────────────────                    │
//! │  The message key is sealed twice: once to the recipient's public       │
//! │  key, once to the sender's own, so both sides can re-read history.     │
//! │                                                                         │
//! │  Layer 3: Private Key at Rest (Argon2id + AES-256-GCM)                 │
//! │  ─────────────────────────────────────────────────────                  │
//! │  The store keeps the private key encrypted under a password derived    │
//! │  from the session. It never sees the key in the clear.                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod crypto;
pub mod error;
pub mod messaging;
pub mod storage;
/// Wall-clock helpers.
pub mod time;
pub mod vault;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{KdfParams, MessagingConfig};
pub use crypto::{KeyCodec, KeyPair, PublicKey};
pub use error::{Error, Result};
pub use messaging::{
    Connectivity, ConnectivityFlag, ConversationSummary, ConversationView, MessageEnvelope, MessageType,
    MessagingSession, Outbox, SendOutcome, TranscriptEntry, ViewState,
};
pub use storage::{Backend, MemoryBackend, SqliteBackend};
pub use vault::{KeyVault, SessionCredentials, VaultState};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Parley Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
