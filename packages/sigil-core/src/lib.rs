//! # Sigil Core
//!
//! End-to-end encryption for users with several devices. Each device holds
//! its own long-term keys; every conversation is encrypted under a versioned
//! symmetric key that is wrapped once per trusted device and ratcheted per
//! message.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SIGIL CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                        SigilSession                             │   │
//! │  └──────┬──────────────┬──────────────┬──────────────┬─────────────┘   │
//! │         │              │              │              │                 │
//! │  ┌──────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐ ┌─────▼────────┐        │
//! │  │   Codec     │ │Conversation│ │  Device    │ │  Recovery    │        │
//! │  │             │ │            │ │            │ │              │        │
//! │  │ - Envelopes │ │ - Versions │ │ - Registry │ │ - Classify   │        │
//! │  │ - Chunking  │ │ - Wrapping │ │ - Trust    │ │ - Strategies │        │
//! │  │ - Signing   │ │ - Rotation │ │ - Revoke   │ │ - Backoff    │        │
//! │  └──────┬──────┘ └─────┬──────┘ └─────┬──────┘ └──────────────┘        │
//! │         │              │              │                                 │
//! │  ┌──────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐ ┌──────────────┐        │
//! │  │  Ratchet    │ │ KeyCache   │ │Negotiation │ │   Storage    │        │
//! │  │             │ │            │ │            │ │              │        │
//! │  │ - HMAC      │ │ - TTL      │ │ - Hybrid > │ │ - Key store  │        │
//! │  │   chains    │ │ - Autotune │ │   PQ >     │ │ - Backups    │        │
//! │  │ - Skipped   │ │            │ │   Classical│ │              │        │
//! │  └─────────────┘ └────────────┘ └────────────┘ └──────────────┘        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Crypto: X25519, Kyber768/1024, AES-256-GCM, ChaCha20-Poly1305, │   │
//! │  │          Ed25519, HKDF/HMAC-SHA256, Argon2id                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error type and the fixed error taxonomy
//! - [`config`] - Configuration with validation
//! - [`crypto`] - Algorithms, device keys, AEAD, signatures, KDFs
//! - [`device`] - Device registry and trust
//! - [`negotiation`] - Algorithm selection across participants
//! - [`conversation`] - Conversation key versions and the key directory
//! - [`ratchet`] - Per-message key derivation
//! - [`codec`] - Envelope encryption
//! - [`cache`] - Key cache and adaptive tuning
//! - [`recovery`] - Error classification and recovery
//! - [`storage`] - Secure key store and backups
//! - [`events`] - Security event log
//! - [`session`] - Everything wired together for one device
//!
//! ## Quick Start
//!
//! ```ignore
//! let directory = Arc::new(MemoryDirectory::new());
//! let alice = SigilSession::bootstrap(
//!     "alice",
//!     DeviceProfile::new("Laptop", DeviceKind::Desktop, CapabilitySet::all()),
//!     SigilConfig::default(),
//!     SecureKeyStore::in_memory(BackupConfig::default()),
//!     directory.clone(),
//! ).await?;
//!
//! alice.setup_conversation("conv", &participants, None).await?;
//! let envelope = alice.encrypt("conv", b"hello").await?;
//! let plaintext = bob.decrypt("conv", &envelope).await?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod cache;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod crypto;
pub mod device;
pub mod encoding;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod ratchet;
pub mod recovery;
pub mod session;
pub mod storage;
/// Time helpers shared by every module.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use codec::Envelope;
pub use config::SigilConfig;
pub use conversation::{KeyDirectory, MemoryDirectory, RotationReason};
pub use crypto::{Algorithm, AlgorithmFamily, CapabilitySet};
pub use device::{DeviceKind, TrustState, Verification};
pub use error::{Error, ErrorKind, Result};
pub use events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
pub use session::{DeviceProfile, SigilSession};
pub use storage::SecureKeyStore;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Sigil Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Wire ids of every algorithm this build supports, most preferred first
pub fn supported_algorithms() -> Vec<&'static str> {
    let mut algorithms = Algorithm::ALL.to_vec();
    algorithms.sort_by(|a, b| b.preference_cmp(a));
    algorithms.iter().map(|a| a.id()).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_supported_algorithms_order() {
        let ids = supported_algorithms();
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], "x25519-kyber768-aes256gcm");
        assert_eq!(ids[5], "x25519-chacha20poly1305");
    }
}
