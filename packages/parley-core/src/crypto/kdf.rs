//! # Key Derivation Functions
//!
//! Two derivations live here:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    KEY DERIVATION                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Private key at rest                                                   │
//! │  ────────────────────                                                   │
//! │  Argon2id(password = "{user_id}:{token prefix}", salt = 16 random B)  │
//! │        → 32-byte AES-256-GCM wrapping key                              │
//! │                                                                         │
//! │  Per-message key wrap                                                  │
//! │  ────────────────────                                                   │
//! │  X25519(ephemeral secret, recipient public) → dh_output               │
//! │  HKDF-SHA256(                                                          │
//! │    ikm  = dh_output,                                                   │
//! │    salt = ephemeral_public || recipient_public,                        │
//! │    info = "parley-key-wrap-v1"                                         │
//! │  ) → 32-byte AES-256-GCM key-encryption key                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::KdfParams;
use crate::error::{Error, Result};

/// Size of the password salt in bytes
pub const SALT_SIZE: usize = 16;

/// Domain separation strings for HKDF
pub mod domain {
    /// Domain for wrapping a per-message key to a public key
    pub const KEY_WRAP: &[u8] = b"parley-key-wrap-v1";
}

/// Password that wraps a user's private key at rest
///
/// `"{user_id}:{first prefix_len chars of the access token}"`. Same inputs
/// always give the same password; the value is wiped on drop and never
/// printed.
#[derive(Clone)]
pub struct SessionPassword(Zeroizing<String>);

impl SessionPassword {
    /// Derive the password for an authenticated session
    pub fn derive(user_id: &str, access_token: &str, prefix_len: usize) -> Self {
        let prefix: String = access_token.chars().take(prefix_len).collect();
        Self(Zeroizing::new(format!("{}:{}", user_id, prefix)))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl PartialEq for SessionPassword {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SessionPassword {}

impl std::fmt::Debug for SessionPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionPassword(..)")
    }
}

/// Generate a fresh random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the private-key wrapping key from a password and salt
///
/// CPU and memory heavy; call it from a blocking context.
pub fn derive_wrapping_key(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
        .map_err(|e| Error::KeyDerivationFailed(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| Error::KeyDerivationFailed(e.to_string()))?;
    Ok(key)
}

/// Derive the key-encryption key for one sealed message key
pub fn derive_wrap_key(
    dh_output: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), dh_output);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(domain::KEY_WRAP, key.as_mut())
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;
    Ok(key)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_wrapping_key_deterministic() {
        let salt = [3u8; SALT_SIZE];
        let k1 = derive_wrapping_key(b"user-1:token", &salt, &fast_params()).unwrap();
        let k2 = derive_wrapping_key(b"user-1:token", &salt, &fast_params()).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_wrapping_key_depends_on_salt_and_password() {
        let params = fast_params();
        let base = derive_wrapping_key(b"pw", &[1u8; SALT_SIZE], &params).unwrap();
        let other_salt = derive_wrapping_key(b"pw", &[2u8; SALT_SIZE], &params).unwrap();
        let other_pw = derive_wrapping_key(b"pw2", &[1u8; SALT_SIZE], &params).unwrap();
        assert_ne!(*base, *other_salt);
        assert_ne!(*base, *other_pw);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 1,
            parallelism: 1,
        };
        let result = derive_wrapping_key(b"pw", &[0u8; SALT_SIZE], &params);
        assert!(matches!(result, Err(Error::KeyDerivationFailed(_))));
    }

    #[test]
    fn test_wrap_key_binds_both_public_keys() {
        let dh = [9u8; 32];
        let k1 = derive_wrap_key(&dh, &[1u8; 32], &[2u8; 32]).unwrap();
        let k2 = derive_wrap_key(&dh, &[1u8; 32], &[3u8; 32]).unwrap();
        let k3 = derive_wrap_key(&dh, &[4u8; 32], &[2u8; 32]).unwrap();
        assert_ne!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn test_session_password_deterministic() {
        let token = "a".repeat(40);
        let p1 = SessionPassword::derive("user-1", &token, 32);
        let p2 = SessionPassword::derive("user-1", &token, 32);
        assert_eq!(p1, p2);
        assert_eq!(p1.as_bytes(), format!("user-1:{}", "a".repeat(32)).as_bytes());
    }

    #[test]
    fn test_session_password_changes_with_inputs() {
        let base = SessionPassword::derive("user-1", "token-abc", 32);
        assert_ne!(base, SessionPassword::derive("user-2", "token-abc", 32));
        assert_ne!(base, SessionPassword::derive("user-1", "token-xyz", 32));
    }

    #[test]
    fn test_session_password_prefix_only() {
        // Only the prefix participates, so tails beyond it are ignored.
        let p1 = SessionPassword::derive("u", "0123456789-first", 10);
        let p2 = SessionPassword::derive("u", "0123456789-second", 10);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_session_password_multibyte_token() {
        let pw = SessionPassword::derive("u", "ééééé", 3);
        assert_eq!(pw.as_bytes(), "u:ééé".as_bytes());
        assert_eq!(format!("{:?}", pw), "SessionPassword(..)");
    }

    #[test]
    fn test_salts_are_unique() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
