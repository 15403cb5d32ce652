//! # Key Management
//!
//! Key types used by the messaging core.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  KeyPair (X25519)                                                      │
//! │  • One per user, generated on first activation                         │
//! │  • Public half is world-readable (stored as base64)                    │
//! │  • Secret half only ever leaves memory wrapped under the               │
//! │    session-derived password                                            │
//! │                                                                         │
//! │  SymmetricKey (AES-256-GCM)                                            │
//! │  • Fresh per outbound message                                          │
//! │  • Encrypts one body, then is wrapped twice and dropped                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// Size of an AES-256 key in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// X25519 keypair owned by an activated vault
///
/// The secret is zeroized when the keypair is dropped (x25519-dalek
/// zeroizes `StaticSecret` on drop).
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair from the OS RNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from raw secret bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw secret bytes, only for wrapping under a password
    pub(crate) fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 Diffie-Hellman against a peer public key
    pub(crate) fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Ephemeral AES-256-GCM key for a single message
#[derive(ZeroizeOnDrop, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        assert_ne!(kp1.public_key().as_bytes(), kp2.public_key().as_bytes());
    }

    #[test]
    fn test_keypair_from_secret_bytes() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(original.secret_bytes());
        assert_eq!(original.public_key().as_bytes(), restored.public_key().as_bytes());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(
            alice.diffie_hellman(bob.public_key()),
            bob.diffie_hellman(alice.public_key())
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::from_secret_bytes([7u8; 32]);
        let rendered = format!("{:?}", kp);
        assert!(!rendered.contains(&hex::encode([7u8; 32])));
        assert_eq!(format!("{:?}", SymmetricKey::from_bytes([1u8; 32])), "SymmetricKey(..)");
    }

    #[test]
    fn test_symmetric_keys_are_random() {
        assert_ne!(SymmetricKey::generate(), SymmetricKey::generate());
    }
}
