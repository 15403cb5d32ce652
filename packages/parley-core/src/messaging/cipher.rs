//! Per-message envelope encryption.
//!
//! `MessageCipher` knows only its own keypair. It never decides which wrapped
//! key to use; the session picks `encrypted_key_sender` or
//! `encrypted_key_receiver` and hands it in.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::crypto::{self, KeyCodec, KeyPair, Nonce, SymmetricKey};
use crate::error::{Error, Result};

/// Output of [`MessageCipher::encrypt_for_recipient`], all base64
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub encrypted_content: String,
    pub encrypted_key_for_sender: String,
    pub encrypted_key_for_receiver: String,
    pub nonce: String,
}

/// Encrypts outbound bodies and decrypts bodies addressed to this keypair
#[derive(Clone)]
pub struct MessageCipher {
    keypair: Arc<KeyPair>,
    codec: KeyCodec,
}

impl MessageCipher {
    /// Build a cipher around the caller's live keypair
    pub fn new(keypair: Arc<KeyPair>) -> Self {
        Self {
            keypair,
            codec: KeyCodec::default(),
        }
    }

    /// Encrypt once, wrap the message key for both sides
    ///
    /// `None` on any failure; the cause is logged.
    pub fn encrypt_for_recipient(&self, plaintext: &str, recipient_public_key: &str) -> Option<EncryptedPayload> {
        match self.try_encrypt_for_recipient(plaintext, recipient_public_key) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!("Message encryption failed: {}", e);
                None
            }
        }
    }

    /// Like [`encrypt_for_recipient`](Self::encrypt_for_recipient) but reports the error kind
    pub fn try_encrypt_for_recipient(&self, plaintext: &str, recipient_public_key: &str) -> Result<EncryptedPayload> {
        let recipient = self.codec.import_public_key(recipient_public_key)?;
        let message_key = self.codec.generate_symmetric_key();

        let (nonce, ciphertext) = crypto::encrypt(&message_key, plaintext.as_bytes(), b"")?;
        let for_receiver = crypto::seal_key(&message_key, &recipient)?;
        let for_sender = crypto::seal_key(&message_key, self.keypair.public_key())?;

        Ok(EncryptedPayload {
            encrypted_content: BASE64.encode(&ciphertext),
            encrypted_key_for_sender: BASE64.encode(&for_sender),
            encrypted_key_for_receiver: BASE64.encode(&for_receiver),
            nonce: BASE64.encode(nonce.as_bytes()),
        })
    }

    /// Open a wrapped key and decrypt the body
    ///
    /// `None` on any failure. Never returns a wrong plaintext.
    pub fn decrypt_received_message(&self, encrypted_content: &str, encrypted_key: &str, nonce: &str) -> Option<String> {
        match self.try_decrypt_received_message(encrypted_content, encrypted_key, nonce) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                tracing::debug!("Message decryption failed: {}", e);
                None
            }
        }
    }

    /// Like [`decrypt_received_message`](Self::decrypt_received_message) but reports the error kind
    pub fn try_decrypt_received_message(&self, encrypted_content: &str, encrypted_key: &str, nonce: &str) -> Result<String> {
        let ciphertext = decode("content", encrypted_content)?;
        let nonce = Nonce::from_slice(&decode("nonce", nonce)?)?;
        let message_key = self.unwrap_key(encrypted_key)?;

        let plaintext = crypto::decrypt(&message_key, &nonce, &ciphertext, b"")?;
        String::from_utf8(plaintext).map_err(|_| Error::DecryptionError)
    }

    /// Open one wrapped message key with this cipher's keypair
    pub fn unwrap_key(&self, encrypted_key: &str) -> Result<SymmetricKey> {
        let sealed = decode("wrapped key", encrypted_key)?;
        crypto::open_key(&sealed, &self.keypair)
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCipher")
            .field("keypair", &self.keypair)
            .finish_non_exhaustive()
    }
}

fn decode(what: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| Error::EncodingError(format!("{}: {}", what, e)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        cipher: MessageCipher,
        public_key: String,
    }

    fn party() -> Party {
        let keypair = Arc::new(KeyPair::generate());
        let public_key = KeyCodec::default().export_public_key(keypair.public_key());
        Party {
            cipher: MessageCipher::new(keypair),
            public_key,
        }
    }

    #[test]
    fn test_recipient_can_decrypt() {
        let alice = party();
        let bob = party();

        let payload = alice.cipher.encrypt_for_recipient("hi bob", &bob.public_key).unwrap();
        let plaintext = bob.cipher.decrypt_received_message(
            &payload.encrypted_content,
            &payload.encrypted_key_for_receiver,
            &payload.nonce,
        );
        assert_eq!(plaintext.as_deref(), Some("hi bob"));
    }

    #[test]
    fn test_sender_can_reread_own_message() {
        let alice = party();
        let bob = party();

        let payload = alice.cipher.encrypt_for_recipient("note to self", &bob.public_key).unwrap();
        let plaintext = alice.cipher.decrypt_received_message(
            &payload.encrypted_content,
            &payload.encrypted_key_for_sender,
            &payload.nonce,
        );
        assert_eq!(plaintext.as_deref(), Some("note to self"));
    }

    #[test]
    fn test_both_wraps_hold_the_same_key() {
        let alice = party();
        let bob = party();

        let payload = alice.cipher.encrypt_for_recipient("x", &bob.public_key).unwrap();
        let from_sender = alice.cipher.unwrap_key(&payload.encrypted_key_for_sender).unwrap();
        let from_receiver = bob.cipher.unwrap_key(&payload.encrypted_key_for_receiver).unwrap();
        assert_eq!(from_sender, from_receiver);
    }

    #[test]
    fn test_wrong_direction_key_fails() {
        let alice = party();
        let bob = party();

        let payload = alice.cipher.encrypt_for_recipient("hi", &bob.public_key).unwrap();
        // Bob holding the sender's wrap cannot open it.
        let result = bob.cipher.decrypt_received_message(
            &payload.encrypted_content,
            &payload.encrypted_key_for_sender,
            &payload.nonce,
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let alice = party();
        let bob = party();
        let eve = party();

        let payload = alice.cipher.encrypt_for_recipient("secret", &bob.public_key).unwrap();
        let result = eve.cipher.try_decrypt_received_message(
            &payload.encrypted_content,
            &payload.encrypted_key_for_receiver,
            &payload.nonce,
        );
        assert!(matches!(result, Err(Error::DecryptionError)));
    }

    #[test]
    fn test_tampered_content_fails() {
        let alice = party();
        let bob = party();

        let payload = alice.cipher.encrypt_for_recipient("original", &bob.public_key).unwrap();
        let mut bytes = BASE64.decode(&payload.encrypted_content).unwrap();
        bytes[0] ^= 0x80;
        let tampered = BASE64.encode(&bytes);

        let result = bob.cipher.decrypt_received_message(&tampered, &payload.encrypted_key_for_receiver, &payload.nonce);
        assert!(result.is_none());
    }

    #[test]
    fn test_bad_recipient_key() {
        let alice = party();
        assert!(alice.cipher.encrypt_for_recipient("hi", "not-a-key").is_none());
        assert!(matches!(
            alice.cipher.try_encrypt_for_recipient("hi", &BASE64.encode([0u8; 16])),
            Err(Error::EncodingError(_))
        ));
    }

    #[test]
    fn test_malformed_fields_are_encoding_errors() {
        let bob = party();
        let result = bob.cipher.try_decrypt_received_message("@@@", "AAAA", "AAAA");
        assert!(matches!(result, Err(Error::EncodingError(_))));
    }

    #[test]
    fn test_fresh_key_and_nonce_per_message() {
        let alice = party();
        let bob = party();
        let p1 = alice.cipher.encrypt_for_recipient("same", &bob.public_key).unwrap();
        let p2 = alice.cipher.encrypt_for_recipient("same", &bob.public_key).unwrap();
        assert_ne!(p1.nonce, p2.nonce);
        assert_ne!(p1.encrypted_content, p2.encrypted_content);
        assert_ne!(p1.encrypted_key_for_receiver, p2.encrypted_key_for_receiver);
    }
}
