//! # Configuration
//!
//! Tunables for the messaging core. Every field has a default, so an empty
//! JSON object is a valid configuration.
//!
//! ```ignore
//! let config = MessagingConfig::from_json(r#"{ "store_timeout_ms": 5000 }"#)?;
//! assert_eq!(config.token_prefix_len, 32);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Argon2id cost parameters for the private-key wrapping key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP's interactive-login recommendation for Argon2id.
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Configuration for the messaging core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Upper bound on any single store round-trip
    pub store_timeout_ms: u64,
    /// How many characters of the access token feed the session password
    pub token_prefix_len: usize,
    /// Argon2id parameters
    pub kdf: KdfParams,
    /// Largest plaintext accepted by `send_message`
    pub max_message_bytes: usize,
    /// Text shown in place of a message that fails to decrypt
    pub undecryptable_placeholder: String,
    /// Capacity of the real-time insert channel
    pub realtime_buffer: usize,
    /// Durable outbox log; `None` keeps the outbox in memory
    pub outbox_path: Option<PathBuf>,
    /// First retry delay for queued sends
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling for queued sends
    pub retry_max_delay_ms: u64,
    /// How often the outbox worker wakes up
    pub outbox_flush_interval_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 15_000,
            token_prefix_len: 32,
            kdf: KdfParams::default(),
            max_message_bytes: 64 * 1024,
            undecryptable_placeholder: "[Unable to decrypt]".to_string(),
            realtime_buffer: 256,
            outbox_path: None,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            outbox_flush_interval_ms: 5_000,
        }
    }
}

impl MessagingConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the core misbehave
    pub fn validate(&self) -> Result<()> {
        if self.store_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store_timeout_ms must be positive".into()));
        }
        if self.token_prefix_len == 0 {
            return Err(Error::InvalidConfig("token_prefix_len must be positive".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::InvalidConfig("max_message_bytes must be positive".into()));
        }
        if self.realtime_buffer == 0 {
            return Err(Error::InvalidConfig("realtime_buffer must be positive".into()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::InvalidConfig(
                "retry_base_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }
        let kdf = &self.kdf;
        if kdf.iterations == 0 || kdf.parallelism == 0 {
            return Err(Error::InvalidConfig("kdf iterations and parallelism must be positive".into()));
        }
        // Argon2 requires at least 8 KiB per lane.
        if kdf.memory_kib < 8 * kdf.parallelism {
            return Err(Error::InvalidConfig(format!(
                "kdf memory_kib must be at least {}",
                8 * kdf.parallelism
            )));
        }
        Ok(())
    }

    /// Store timeout as a `Duration`
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// First retry delay as a `Duration`
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry ceiling as a `Duration`
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Outbox worker period as a `Duration`
    pub fn outbox_flush_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_flush_interval_ms)
    }

    /// Defaults with the cheapest Argon2id parameters, for unit tests
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        Self {
            kdf: KdfParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MessagingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.token_prefix_len, 32);
        assert_eq!(config.undecryptable_placeholder, "[Unable to decrypt]");
        assert_eq!(config.store_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MessagingConfig::from_json(r#"{ "store_timeout_ms": 2500, "kdf": { "iterations": 3 } }"#)
            .unwrap();
        assert_eq!(config.store_timeout_ms, 2500);
        assert_eq!(config.kdf.iterations, 3);
        assert_eq!(config.kdf.memory_kib, KdfParams::default().memory_kib);
        assert!(config.outbox_path.is_none());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = MessagingConfig::from_json(r#"{ "store_timeout_ms": 0 }"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tiny_kdf_memory() {
        let mut config = MessagingConfig::default();
        config.kdf.memory_kib = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = MessagingConfig::default();
        config.retry_base_delay_ms = 10_000;
        config.retry_max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(MessagingConfig::from_json("not json").is_err());
    }
}
