//! # Cryptography Module
//!
//! All cryptographic primitives used by Parley Core.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    KEY AT REST                                  │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  SessionPassword ("{user_id}:{token prefix}")                  │   │
//! │  │            │  + 16-byte random salt                            │   │
//! │  │            ▼                                                    │   │
//! │  │  Argon2id ──► wrapping key ──► AES-256-GCM(X25519 secret)      │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 PER-MESSAGE ENVELOPE                            │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  SymmetricKey (fresh) ──► AES-256-GCM(body)                    │   │
//! │  │        │                                                        │   │
//! │  │        ├──► seal_key(recipient public) ──► key_for_receiver    │   │
//! │  │        └──► seal_key(sender public)    ──► key_for_sender      │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | X25519 | Identity keypair, ECIES key wrap |
//! | HKDF-SHA256 | Key-encryption key from the ECDH output |
//! | AES-256-GCM | Bodies, wrapped keys, wrapped private key |
//! | Argon2id | Password-based private key wrapping |
//!
//! Secret keys are zeroized on drop and randomness comes from `OsRng`.

mod codec;
mod encryption;
mod kdf;
mod keys;

pub use codec::{ExportedPrivateKey, KeyCodec};
pub use encryption::{decrypt, encrypt, open_key, seal_key, Nonce, NONCE_SIZE, SEALED_KEY_SIZE};
pub use kdf::{SessionPassword, SALT_SIZE};
pub use keys::{KeyPair, SymmetricKey, SYMMETRIC_KEY_SIZE};

pub use x25519_dalek::PublicKey;

/// Size of public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
