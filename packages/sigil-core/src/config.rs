//! # Configuration
//!
//! Runtime configuration for a [`SigilSession`](crate::SigilSession).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SigilConfig                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  cache        TTL, batch size, compression threshold + tuning bounds    │
//! │  ratchet      skip window, retained out-of-order keys                   │
//! │  codec        chunk size, maximum message size                          │
//! │  rotation     periodic policy interval                                  │
//! │  recovery     attempt bounds, retry backoff                             │
//! │  backup       password policy, Argon2id cost                            │
//! │  negotiation  minimum acceptable algorithm family                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every group has defaults, so a JSON document only needs the fields it
//! overrides. Durations are whole milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::AlgorithmFamily;
use crate::error::{Error, Result};
use crate::time::duration_ms;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigilConfig {
    /// Key cache and adaptive tuning
    pub cache: CacheConfig,
    /// Message ratchet
    pub ratchet: RatchetConfig,
    /// Envelope codec
    pub codec: CodecConfig,
    /// Conversation key rotation policy
    pub rotation: RotationConfig,
    /// Error recovery
    pub recovery: RecoveryConfig,
    /// Password-encrypted backups
    pub backup: BackupConfig,
    /// Algorithm negotiation policy
    pub negotiation: NegotiationConfig,
}

/// Key cache settings and the bounds the optimizer may move them within
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of an unwrapped conversation key in the cache
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    /// Envelopes encrypted per batch before yielding
    pub batch_size: usize,
    /// Payloads at or above this many bytes are compressed
    pub compression_threshold: usize,
    #[serde(with = "duration_ms")]
    pub min_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub max_ttl: Duration,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_compression_threshold: usize,
    pub max_compression_threshold: usize,
    /// How often the optimizer retunes
    #[serde(with = "duration_ms")]
    pub autotune_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            batch_size: 16,
            compression_threshold: 1024,
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(60 * 60),
            min_batch_size: 1,
            max_batch_size: 256,
            min_compression_threshold: 256,
            max_compression_threshold: 64 * 1024,
            autotune_interval: Duration::from_secs(30),
        }
    }
}

/// Ratchet settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Largest forward jump tolerated on a receiving chain
    pub max_skip: u32,
    /// Skipped message keys retained per conversation
    pub max_skipped_keys: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
        }
    }
}

/// Codec settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payloads larger than this are split into linked envelopes
    pub chunk_size: usize,
    /// Largest plaintext accepted by `encrypt_message`
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Rotation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Conversations older than this at their current version are due
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive key mismatches tolerated before escalation
    pub max_attempts: u32,
    /// Unrecoverable failures before sends require a forced rotation
    pub unrecoverable_threshold: u32,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    /// Retries for transient network failures
    pub network_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unrecoverable_threshold: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            network_retries: 3,
        }
    }
}

/// Backup password policy and Argon2id cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub min_password_length: usize,
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            min_password_length: 12,
            argon2_memory_kib: 19 * 1024,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

/// Negotiation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Weakest family accepted without explicit downgrade consent
    pub minimum_family: AlgorithmFamily,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            minimum_family: AlgorithmFamily::Classical,
        }
    }
}

impl SigilConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SigilConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.min_ttl > cache.max_ttl || cache.ttl < cache.min_ttl || cache.ttl > cache.max_ttl {
            return Err(Error::InvalidConfig(
                "cache.ttl must lie within [min_ttl, max_ttl]".into(),
            ));
        }
        if cache.min_batch_size == 0
            || cache.min_batch_size > cache.max_batch_size
            || cache.batch_size < cache.min_batch_size
            || cache.batch_size > cache.max_batch_size
        {
            return Err(Error::InvalidConfig(
                "cache.batch_size must lie within [min_batch_size, max_batch_size] and be non-zero".into(),
            ));
        }
        if cache.min_compression_threshold > cache.max_compression_threshold
            || cache.compression_threshold < cache.min_compression_threshold
            || cache.compression_threshold > cache.max_compression_threshold
        {
            return Err(Error::InvalidConfig(
                "cache.compression_threshold must lie within its bounds".into(),
            ));
        }
        if cache.autotune_interval.is_zero() {
            return Err(Error::InvalidConfig("cache.autotune_interval must be non-zero".into()));
        }

        if self.ratchet.max_skip == 0 {
            return Err(Error::InvalidConfig("ratchet.max_skip must be non-zero".into()));
        }

        if self.codec.chunk_size == 0 || self.codec.chunk_size > self.codec.max_message_size {
            return Err(Error::InvalidConfig(
                "codec.chunk_size must be non-zero and no larger than max_message_size".into(),
            ));
        }

        if self.rotation.interval.is_zero() {
            return Err(Error::InvalidConfig("rotation.interval must be non-zero".into()));
        }

        let recovery = &self.recovery;
        if recovery.max_attempts == 0 || recovery.unrecoverable_threshold == 0 {
            return Err(Error::InvalidConfig(
                "recovery.max_attempts and unrecoverable_threshold must be non-zero".into(),
            ));
        }
        if recovery.retry_base_delay > recovery.retry_max_delay {
            return Err(Error::InvalidConfig(
                "recovery.retry_base_delay must not exceed retry_max_delay".into(),
            ));
        }

        let backup = &self.backup;
        if backup.min_password_length == 0 {
            return Err(Error::InvalidConfig("backup.min_password_length must be non-zero".into()));
        }
        if backup.argon2_iterations == 0 || backup.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig("backup Argon2 costs must be non-zero".into()));
        }
        // Argon2 requires at least 8 KiB per lane
        if backup.argon2_memory_kib < 8 * backup.argon2_parallelism {
            return Err(Error::InvalidConfig("backup.argon2_memory_kib is too small".into()));
        }

        Ok(())
    }

    /// Configuration with cheap backup KDF costs, for tests and demos
    pub fn fast_kdf() -> Self {
        let mut config = Self::default();
        config.backup.argon2_memory_kib = 64;
        config.backup.argon2_iterations = 1;
        config
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        SigilConfig::default().validate().unwrap();
        SigilConfig::fast_kdf().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SigilConfig::from_json(
            r#"{ "ratchet": { "max_skip": 50 }, "cache": { "ttl": 60000 } }"#,
        )
        .unwrap();
        assert_eq!(config.ratchet.max_skip, 50);
        assert_eq!(config.ratchet.max_skipped_keys, 2000);
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.backup, BackupConfig::default());
    }

    #[test]
    fn test_minimum_family_from_json() {
        let config =
            SigilConfig::from_json(r#"{ "negotiation": { "minimum_family": "post_quantum" } }"#)
                .unwrap();
        assert_eq!(config.negotiation.minimum_family, AlgorithmFamily::PostQuantum);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SigilConfig::from_json(r#"{ "cache": { "batch_size": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = SigilConfig::from_json(r#"{ "codec": { "chunk_size": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = SigilConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
