//! # Key Vault
//!
//! Owns the signed-in user's keypair for the lifetime of a session.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        VAULT STATE MACHINE                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   Uninitialized ──activate()──► Loading ──┬──► Ready                   │
//! │         ▲                                 └──► Failed                  │
//! │         └──────────────── deactivate() ◄──────────┘                    │
//! │                                                                         │
//! │  activate(user_id, access_token)                                       │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  password = "{user_id}:{token[..prefix_len]}"               │       │
//! │  │                                                             │       │
//! │  │  record stored?                                             │       │
//! │  │    yes → Argon2id(password, key_salt) → unwrap secret       │       │
//! │  │          check secret matches public_key                    │       │
//! │  │    no  → generate keypair, wrap secret, insert record       │       │
//! │  │          (lost an insert race → load the winner's record)   │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The password is tied to the access token. Once the token's prefix changes
//! the stored key can no longer be unwrapped and activation fails with
//! `DecryptionError`.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::MessagingConfig;
use crate::crypto::{KeyCodec, KeyPair, SessionPassword};
use crate::error::{Error, Result};
use crate::storage::{with_timeout, Backend, StoredKeyRecord};
use crate::time::now_timestamp_millis;

/// The authenticated session the vault unlocks against
#[derive(Clone)]
pub struct SessionCredentials {
    /// Authenticated user id
    pub user_id: String,
    /// Opaque access token, only its prefix is used
    pub access_token: String,
}

impl SessionCredentials {
    /// Credentials for `user_id` signed in with `access_token`
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Where the vault is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    /// No session yet, or signed out
    Uninitialized,
    /// Fetching or generating keys
    Loading,
    /// Keypair in memory
    Ready,
    /// Last activation failed
    Failed,
}

struct Inner {
    state: VaultState,
    user_id: Option<String>,
    keypair: Option<Arc<KeyPair>>,
    public_key: Option<String>,
}

/// Per-user keypair lifecycle
pub struct KeyVault {
    backend: Arc<dyn Backend>,
    codec: KeyCodec,
    config: MessagingConfig,
    inner: RwLock<Inner>,
    /// Serializes activations
    activation: tokio::sync::Mutex<()>,
}

impl KeyVault {
    /// Create an inactive vault
    pub fn new(backend: Arc<dyn Backend>, config: MessagingConfig) -> Self {
        Self {
            backend,
            codec: KeyCodec::new(config.kdf),
            config,
            inner: RwLock::new(Inner {
                state: VaultState::Uninitialized,
                user_id: None,
                keypair: None,
                public_key: None,
            }),
            activation: tokio::sync::Mutex::new(()),
        }
    }

    /// Load or provision the keypair for a session
    ///
    /// On failure the vault is left in `Failed` and the error is returned.
    pub async fn activate(&self, credentials: &SessionCredentials) -> Result<()> {
        let _guard = self.activation.lock().await;

        {
            let mut inner = self.inner.write();
            inner.state = VaultState::Loading;
            inner.user_id = Some(credentials.user_id.clone());
            inner.keypair = None;
            inner.public_key = None;
        }
        tracing::debug!("Activating key vault for {}", credentials.user_id);

        match self.load_or_create(credentials).await {
            Ok((keypair, public_key)) => {
                let mut inner = self.inner.write();
                inner.state = VaultState::Ready;
                inner.keypair = Some(Arc::new(keypair));
                inner.public_key = Some(public_key);
                tracing::info!("Key vault ready for {}", credentials.user_id);
                Ok(())
            }
            Err(e) => {
                self.inner.write().state = VaultState::Failed;
                tracing::error!("Key vault activation failed for {}: {}", credentials.user_id, e);
                Err(e)
            }
        }
    }

    /// Drop the in-memory keypair (sign-out)
    pub fn deactivate(&self) {
        let mut inner = self.inner.write();
        inner.state = VaultState::Uninitialized;
        inner.user_id = None;
        inner.keypair = None;
        inner.public_key = None;
        tracing::info!("Key vault deactivated");
    }

    /// Look up a peer's published public key
    ///
    /// `None` when the peer never set up messaging.
    pub async fn get_recipient_public_key(&self, peer_id: &str) -> Result<Option<String>> {
        let record = with_timeout(
            self.config.store_timeout(),
            "get_key_record",
            self.backend.get_key_record(peer_id),
        )
        .await?;
        Ok(record.map(|r| r.public_key))
    }

    /// Whether the keypair is loaded and messaging can run
    pub fn is_ready(&self) -> bool {
        self.inner.read().state == VaultState::Ready
    }

    /// Current lifecycle state
    pub fn state(&self) -> VaultState {
        self.inner.read().state
    }

    /// The live keypair, once ready
    pub fn keypair(&self) -> Option<Arc<KeyPair>> {
        self.inner.read().keypair.clone()
    }

    /// Own public key (base64), once ready
    pub fn public_key(&self) -> Option<String> {
        self.inner.read().public_key.clone()
    }

    /// User id of the current or last activation
    pub fn user_id(&self) -> Option<String> {
        self.inner.read().user_id.clone()
    }

    /// The codec this vault encodes keys with
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    // ------------------------------------------------------------------------

    async fn load_or_create(&self, credentials: &SessionCredentials) -> Result<(KeyPair, String)> {
        let password = SessionPassword::derive(
            &credentials.user_id,
            &credentials.access_token,
            self.config.token_prefix_len,
        );

        let existing = with_timeout(
            self.config.store_timeout(),
            "get_key_record",
            self.backend.get_key_record(&credentials.user_id),
        )
        .await?;

        if let Some(record) = existing {
            return self.unlock(&record, &password).await;
        }

        let keypair = self.codec.generate_key_pair();
        let exported = self.codec.export_private_key(&keypair, &password).await?;
        let public_key = self.codec.export_public_key(keypair.public_key());

        let record = StoredKeyRecord {
            user_id: credentials.user_id.clone(),
            public_key: public_key.clone(),
            encrypted_private_key: exported.encrypted_private_key,
            key_salt: exported.salt,
            created_at: now_timestamp_millis(),
        };

        let inserted = with_timeout(
            self.config.store_timeout(),
            "insert_key_record",
            self.backend.insert_key_record(record),
        )
        .await;

        match inserted {
            Ok(()) => {
                tracing::info!("Provisioned new messaging keys for {}", credentials.user_id);
                Ok((keypair, public_key))
            }
            Err(Error::KeyRecordExists) => {
                tracing::warn!(
                    "Key record for {} was created concurrently, loading it",
                    credentials.user_id
                );
                let winner = with_timeout(
                    self.config.store_timeout(),
                    "get_key_record",
                    self.backend.get_key_record(&credentials.user_id),
                )
                .await?
                .ok_or_else(|| Error::StorageNotFound(format!("key record for {}", credentials.user_id)))?;
                self.unlock(&winner, &password).await
            }
            Err(e) => Err(e),
        }
    }

    async fn unlock(&self, record: &StoredKeyRecord, password: &SessionPassword) -> Result<(KeyPair, String)> {
        let keypair = self
            .codec
            .import_private_key(&record.encrypted_private_key, password, &record.key_salt)
            .await?;
        let public = self.codec.import_public_key(&record.public_key)?;

        if keypair.public_key().as_bytes() != public.as_bytes() {
            return Err(Error::DecryptionError);
        }

        Ok((keypair, record.public_key.clone()))
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("KeyVault")
            .field("state", &inner.state)
            .field("user_id", &inner.user_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
