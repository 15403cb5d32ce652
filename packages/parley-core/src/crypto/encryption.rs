//! # Encryption Module
//!
//! AES-256-GCM for message bodies and wrapped private keys, plus the
//! ECIES-style seal that wraps a per-message key to a public key.
//!
//! ## Key Sealing
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SEAL / OPEN                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  seal_key(message_key, recipient_public)                               │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  ephemeral = random X25519 secret                            │       │
//! │  │  dh        = ephemeral × recipient_public                    │       │
//! │  │  kek       = HKDF(dh, eph_pub || recipient_pub)              │       │
//! │  │  ct        = AES-256-GCM(kek, nonce, message_key)            │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │  Output: eph_pub (32) || nonce (12) || ct (32 + 16 tag)               │
//! │                                                                         │
//! │  open_key(sealed, recipient_keypair)                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  dh  = recipient_secret × eph_pub                            │       │
//! │  │  kek = HKDF(dh, eph_pub || recipient_pub)                    │       │
//! │  │  message_key = AES-256-GCM-Decrypt(kek, nonce, ct)           │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure on the decrypt side collapses into `Error::DecryptionError`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::kdf::derive_wrap_key;
use super::keys::{KeyPair, SymmetricKey, SYMMETRIC_KEY_SIZE};
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of a sealed message key: eph_pub || nonce || ciphertext || tag
pub const SEALED_KEY_SIZE: usize = 32 + NONCE_SIZE + SYMMETRIC_KEY_SIZE + TAG_SIZE;

/// A nonce for AES-GCM encryption
///
/// Always random. Never reuse a nonce with the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, rejecting the wrong length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::EncodingError(format!("nonce must be {} bytes", NONCE_SIZE)))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Encrypt with AES-256-GCM under a fresh random nonce
///
/// Returns `(nonce, ciphertext_with_tag)`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| Error::EncryptionFailed)?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|_| Error::EncryptionFailed)?;

    Ok((nonce, ciphertext))
}

/// Decrypt AES-256-GCM ciphertext
///
/// Fails with `DecryptionError` if the key, nonce or AAD is wrong, or if the
/// ciphertext was modified.
pub fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| Error::DecryptionError)?;

    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|_| Error::DecryptionError)
}

/// Wrap a message key so only the holder of `recipient`'s secret can open it
pub fn seal_key(message_key: &SymmetricKey, recipient: &PublicKey) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let dh = ephemeral.diffie_hellman(recipient);

    let kek = derive_wrap_key(dh.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let kek = SymmetricKey::from_bytes(*kek);
    let (nonce, ciphertext) = encrypt(&kek, message_key.as_bytes(), ephemeral_public.as_bytes())?;

    let mut sealed = Vec::with_capacity(SEALED_KEY_SIZE);
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(nonce.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a key produced by [`seal_key`] with the recipient's keypair
pub fn open_key(sealed: &[u8], recipient: &KeyPair) -> Result<SymmetricKey> {
    if sealed.len() != SEALED_KEY_SIZE {
        return Err(Error::DecryptionError);
    }

    let mut eph_bytes = [0u8; 32];
    eph_bytes.copy_from_slice(&sealed[..32]);
    let ephemeral_public = PublicKey::from(eph_bytes);
    let nonce = Nonce::from_slice(&sealed[32..32 + NONCE_SIZE]).map_err(|_| Error::DecryptionError)?;
    let ciphertext = &sealed[32 + NONCE_SIZE..];

    let dh = recipient.diffie_hellman(&ephemeral_public);
    let kek = derive_wrap_key(&dh, &eph_bytes, recipient.public_key().as_bytes())
        .map_err(|_| Error::DecryptionError)?;
    let kek = SymmetricKey::from_bytes(*kek);

    let plaintext = zeroize::Zeroizing::new(decrypt(&kek, &nonce, ciphertext, &eph_bytes)?);
    let bytes: [u8; SYMMETRIC_KEY_SIZE] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| Error::DecryptionError)?;
    Ok(SymmetricKey::from_bytes(bytes))
}

// ============================================================================
// TESTS
// ============================================================================
