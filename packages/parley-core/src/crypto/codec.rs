//! # Key Codec
//!
//! Serialization of keys to the string forms stored in the key record.
//!
//! | Field | Encoding |
//! |-------|----------|
//! | `public_key` | base64(32 raw X25519 bytes) |
//! | `encrypted_private_key` | base64(nonce (12) ‖ AES-256-GCM(secret) ‖ tag) |
//! | `key_salt` | base64(16 random bytes) |
//!
//! The private key is wrapped under an Argon2id key derived from the
//! [`SessionPassword`]. Argon2id runs on tokio's blocking pool so the caller
//! is suspended instead of stalling the executor.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use super::encryption::{self, Nonce, NONCE_SIZE};
use super::kdf::{self, SessionPassword};
use super::keys::{KeyPair, SymmetricKey};
use crate::config::KdfParams;
use crate::error::{Error, Result};

/// AAD bound into the wrapped private key
const PRIVATE_KEY_AAD: &[u8] = b"parley-private-key-v1";

/// A private key wrapped for storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPrivateKey {
    /// base64(nonce ‖ ciphertext)
    pub encrypted_private_key: String,
    /// base64(salt)
    pub salt: String,
}

/// Converts keys to and from their stored representations
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    params: KdfParams,
}

impl KeyCodec {
    /// Create a codec with the given Argon2id cost parameters
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// Argon2id parameters in use
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Generate a fresh X25519 keypair
    pub fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    /// Generate a fresh per-message AES-256 key
    pub fn generate_symmetric_key(&self) -> SymmetricKey {
        SymmetricKey::generate()
    }

    /// base64 of the raw public key bytes
    pub fn export_public_key(&self, public_key: &PublicKey) -> String {
        BASE64.encode(public_key.as_bytes())
    }

    /// Parse a base64 public key
    pub fn import_public_key(&self, encoded: &str) -> Result<PublicKey> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::EncodingError(format!("public key: {}", e)))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::EncodingError(format!("public key must be 32 bytes, got {}", bytes.len())))?;
        Ok(PublicKey::from(arr))
    }

    /// Wrap the secret half under a fresh salt and the session password
    pub async fn export_private_key(
        &self,
        keypair: &KeyPair,
        password: &SessionPassword,
    ) -> Result<ExportedPrivateKey> {
        let salt = kdf::generate_salt();
        let wrapping_key = self.derive_blocking(password.clone(), salt.to_vec()).await?;

        let secret = Zeroizing::new(keypair.secret_bytes());
        let (nonce, ciphertext) = encryption::encrypt(&wrapping_key, secret.as_ref(), PRIVATE_KEY_AAD)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(nonce.as_bytes());
        blob.extend_from_slice(&ciphertext);

        Ok(ExportedPrivateKey {
            encrypted_private_key: BASE64.encode(&blob),
            salt: BASE64.encode(salt),
        })
    }

    /// Unwrap a stored private key
    ///
    /// Wrong password, wrong salt and corrupted ciphertext are all reported
    /// as the same `DecryptionError`.
    pub async fn import_private_key(
        &self,
        encrypted_private_key: &str,
        password: &SessionPassword,
        salt: &str,
    ) -> Result<KeyPair> {
        let blob = BASE64
            .decode(encrypted_private_key.trim())
            .map_err(|e| Error::EncodingError(format!("private key: {}", e)))?;
        let salt = BASE64
            .decode(salt.trim())
            .map_err(|e| Error::EncodingError(format!("salt: {}", e)))?;

        if blob.len() <= NONCE_SIZE {
            return Err(Error::DecryptionError);
        }
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]).map_err(|_| Error::DecryptionError)?;

        let wrapping_key = self
            .derive_blocking(password.clone(), salt)
            .await
            .map_err(|_| Error::DecryptionError)?;

        let secret = Zeroizing::new(encryption::decrypt(
            &wrapping_key,
            &nonce,
            &blob[NONCE_SIZE..],
            PRIVATE_KEY_AAD,
        )?);
        let secret: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::DecryptionError)?;

        Ok(KeyPair::from_secret_bytes(secret))
    }

    /// Short SHA-256 fingerprint of a public key, for out-of-band comparison
    pub fn fingerprint(&self, public_key: &PublicKey) -> String {
        let digest = Sha256::digest(public_key.as_bytes());
        hex::encode(&digest[..8])
    }

    async fn derive_blocking(&self, password: SessionPassword, salt: Vec<u8>) -> Result<SymmetricKey> {
        let params = self.params;
        tokio::task::spawn_blocking(move || {
            kdf::derive_wrapping_key(password.as_bytes(), &salt, &params)
                .map(|key| SymmetricKey::from_bytes(*key))
        })
        .await
        .map_err(|e| Error::Internal(format!("KDF task failed: {}", e)))?
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::new(KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        })
    }

    fn password(token: &str) -> SessionPassword {
        SessionPassword::derive("user-1", token, 32)
    }

    #[test]
    fn test_public_key_roundtrip() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let encoded = codec.export_public_key(kp.public_key());
        let decoded = codec.import_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), kp.public_key().as_bytes());
    }

    #[test]
    fn test_import_public_key_rejects_garbage() {
        let codec = codec();
        assert!(matches!(codec.import_public_key("%%%"), Err(Error::EncodingError(_))));
        let short = BASE64.encode([1u8; 31]);
        assert!(matches!(codec.import_public_key(&short), Err(Error::EncodingError(_))));
    }

    #[tokio::test]
    async fn test_private_key_roundtrip() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let pw = password("token-123");

        let exported = codec.export_private_key(&kp, &pw).await.unwrap();
        let restored = codec
            .import_private_key(&exported.encrypted_private_key, &pw, &exported.salt)
            .await
            .unwrap();

        assert_eq!(restored.public_key().as_bytes(), kp.public_key().as_bytes());
    }

    #[tokio::test]
    async fn test_fresh_salt_per_export() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let pw = password("token-123");

        let a = codec.export_private_key(&kp, &pw).await.unwrap();
        let b = codec.export_private_key(&kp, &pw).await.unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.encrypted_private_key, b.encrypted_private_key);
    }

    #[tokio::test]
    async fn test_wrong_password_is_decryption_error() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let exported = codec.export_private_key(&kp, &password("token-a")).await.unwrap();

        let result = codec
            .import_private_key(&exported.encrypted_private_key, &password("token-b"), &exported.salt)
            .await;
        assert!(matches!(result, Err(Error::DecryptionError)));
    }

    #[tokio::test]
    async fn test_wrong_salt_is_decryption_error() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let pw = password("token-a");
        let exported = codec.export_private_key(&kp, &pw).await.unwrap();
        let other_salt = BASE64.encode(kdf::generate_salt());

        let result = codec
            .import_private_key(&exported.encrypted_private_key, &pw, &other_salt)
            .await;
        assert!(matches!(result, Err(Error::DecryptionError)));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_decryption_error() {
        let codec = codec();
        let kp = codec.generate_key_pair();
        let pw = password("token-a");
        let exported = codec.export_private_key(&kp, &pw).await.unwrap();

        let mut blob = BASE64.decode(&exported.encrypted_private_key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let result = codec
            .import_private_key(&BASE64.encode(&blob), &pw, &exported.salt)
            .await;
        assert!(matches!(result, Err(Error::DecryptionError)));

        let truncated = BASE64.encode(&blob[..4]);
        let result = codec.import_private_key(&truncated, &pw, &exported.salt).await;
        assert!(matches!(result, Err(Error::DecryptionError)));
    }

    #[tokio::test]
    async fn test_malformed_base64_is_encoding_error() {
        let codec = codec();
        let result = codec
            .import_private_key("not base64!!", &password("t"), "AAAA")
            .await;
        assert!(matches!(result, Err(Error::EncodingError(_))));
    }

    #[test]
    fn test_fingerprint_stable() {
        let codec = codec();
        let kp = KeyPair::from_secret_bytes([5u8; 32]);
        let fp = codec.fingerprint(kp.public_key());
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, codec.fingerprint(kp.public_key()));
        assert_ne!(fp, codec.fingerprint(KeyPair::generate().public_key()));
    }
}
