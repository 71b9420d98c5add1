//! # Error Handling
//!
//! This module provides the error types for Sigil Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level, detailed)          ErrorKind (fixed taxonomy)       │
//! │  │                                                                      │
//! │  ├── Algorithm Errors (100-199)                                        │
//! │  │   ├── UnsupportedAlgorithm     ──►  UnsupportedAlgorithm            │
//! │  │   └── NoCompatibleAlgorithm    ──►  NoCompatibleAlgorithm           │
//! │  │                                                                      │
//! │  ├── Device Errors (200-299)                                           │
//! │  │   ├── FingerprintConflict      ──►  FingerprintConflict             │
//! │  │   ├── DeviceNotTrusted         ──►  DeviceNotTrusted                │
//! │  │   ├── DeviceNotFound           ──►  DeviceNotTrusted                │
//! │  │   └── DeviceRevoked            ──►  DeviceRevoked                   │
//! │  │                                                                      │
//! │  ├── Crypto Errors (300-399)                                           │
//! │  │   ├── IntegrityCheckFailed     ──►  IntegrityCheckFailed            │
//! │  │   ├── InvalidKey               ──►  IntegrityCheckFailed            │
//! │  │   └── KeyMismatchNeedsSetup    ──►  KeyMismatchNeedsSetup           │
//! │  │                                                                      │
//! │  ├── Storage Errors (400-499)                                          │
//! │  │   ├── StorageUnavailable       ──►  StorageUnavailable              │
//! │  │   ├── WeakBackupPassword       ──►  WeakBackupPassword              │
//! │  │   └── BackupDecryptionFailed   ──►  IntegrityCheckFailed            │
//! │  │                                                                      │
//! │  ├── Network Errors (500-599)                                          │
//! │  │   └── NetworkUnavailable       ──►  NetworkUnavailable (transient)  │
//! │  │                                                                      │
//! │  └── Ratchet Errors (600-699)                                          │
//! │      ├── RatchetWindowExceeded    ──►  RatchetWindowExceeded           │
//! │      ├── RatchetStateCorrupted    ──►  RatchetStateCorrupted           │
//! │      └── RotationRequired         ──►  RatchetStateCorrupted           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation Rules
//!
//! | Class | Handling |
//! |-------|----------|
//! | `NetworkUnavailable` | Retried with backoff by the calling component |
//! | `KeyMismatchNeedsSetup`, `DeviceNotTrusted` | Automatic recovery before surfacing |
//! | `IntegrityCheckFailed`, `RatchetStateCorrupted`, `FingerprintConflict` | Never auto-resolved; surfaced as security warnings |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Sigil Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sigil Core
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Algorithm Errors (100-199)
    // ========================================================================

    /// Algorithm id is unknown or the primitive is not available
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Participants share no acceptable algorithm
    #[error("No compatible algorithm: {0}")]
    NoCompatibleAlgorithm(String),

    // ========================================================================
    // Device Errors (200-299)
    // ========================================================================

    /// Two distinct device identities map to the same fingerprint, or a
    /// verification did not match
    #[error("Fingerprint conflict: {0}")]
    FingerprintConflict(String),

    /// Device is not in a trusted state
    #[error("Device is not trusted: {0}")]
    DeviceNotTrusted(String),

    /// Device has been revoked
    #[error("Device has been revoked: {0}")]
    DeviceRevoked(String),

    /// Device is not known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Authentication tag, signature or content hash did not verify
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// Key material is malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption primitive failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// Local and remote conversation key versions disagree, or no key exists
    #[error("Conversation {conversation_id} needs key setup (local version {local:?}, remote version {remote:?})")]
    KeyMismatchNeedsSetup {
        /// Conversation the mismatch was detected for
        conversation_id: String,
        /// Version known locally
        local: Option<u32>,
        /// Version advertised by the key directory
        remote: Option<u32>,
    },

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// The secure store cannot be used
    #[error("Secure storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Item not found in storage
    #[error("Item not found: {0}")]
    StorageNotFound(String),

    /// Stored data failed to decode
    #[error("Data corruption detected: {0}")]
    StorageCorrupted(String),

    /// Backup password below the minimum length policy
    #[error("Backup password must be at least {min_length} characters")]
    WeakBackupPassword {
        /// Minimum accepted length
        min_length: usize,
    },

    /// Backup blob could not be opened (wrong password or tampered blob)
    #[error("Backup could not be decrypted")]
    BackupDecryptionFailed,

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// Key directory or transport is unreachable (transient)
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Operation was cancelled by conversation teardown or device revocation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // ========================================================================
    // Ratchet Errors (600-699)
    // ========================================================================

    /// Peer message number is beyond the skip window
    #[error("Ratchet window exceeded: requested message {requested}, chain at {current}, window {max_skip}")]
    RatchetWindowExceeded {
        /// Message number the peer advertised
        requested: u32,
        /// Next message number expected on the chain
        current: u32,
        /// Configured skip window
        max_skip: u32,
    },

    /// Ratchet state is compromised or inconsistent
    #[error("Ratchet state corrupted: {0}")]
    RatchetStateCorrupted(String),

    /// Ratchet has not been initialized for the conversation
    #[error("Ratchet not initialized for conversation {0}")]
    RatchetNotInitialized(String),

    /// Sends are blocked until the conversation key is rotated
    #[error("Conversation {0} requires a key rotation before sending")]
    RotationRequired(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Message payload rejected before encryption
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// The fixed failure taxonomy every [`Error`] is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown or unavailable algorithm
    UnsupportedAlgorithm,
    /// Empty algorithm intersection or policy violation
    NoCompatibleAlgorithm,
    /// Fingerprint collision or failed verification
    FingerprintConflict,
    /// Device not trusted (or unknown)
    DeviceNotTrusted,
    /// Device revoked
    DeviceRevoked,
    /// Local/remote key version disagreement
    KeyMismatchNeedsSetup,
    /// Tag, signature or hash verification failure
    IntegrityCheckFailed,
    /// Out-of-order delivery beyond the skip window
    RatchetWindowExceeded,
    /// Compromised or inconsistent ratchet
    RatchetStateCorrupted,
    /// Backup password too short
    WeakBackupPassword,
    /// Secure storage cannot be used
    StorageUnavailable,
    /// Transient network failure
    NetworkUnavailable,
    /// Programming or serialization fault
    Internal,
}

impl ErrorKind {
    /// Stable name used in logs and security events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedAlgorithm => "unsupported_algorithm",
            ErrorKind::NoCompatibleAlgorithm => "no_compatible_algorithm",
            ErrorKind::FingerprintConflict => "fingerprint_conflict",
            ErrorKind::DeviceNotTrusted => "device_not_trusted",
            ErrorKind::DeviceRevoked => "device_revoked",
            ErrorKind::KeyMismatchNeedsSetup => "key_mismatch_needs_setup",
            ErrorKind::IntegrityCheckFailed => "integrity_check_failed",
            ErrorKind::RatchetWindowExceeded => "ratchet_window_exceeded",
            ErrorKind::RatchetStateCorrupted => "ratchet_state_corrupted",
            ErrorKind::WeakBackupPassword => "weak_backup_password",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Algorithms
    /// - 200-299: Devices
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 500-599: Network
    /// - 600-699: Ratchet
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Algorithms (100-199)
            Error::UnsupportedAlgorithm(_) => 100,
            Error::NoCompatibleAlgorithm(_) => 101,

            // Devices (200-299)
            Error::FingerprintConflict(_) => 200,
            Error::DeviceNotTrusted(_) => 201,
            Error::DeviceRevoked(_) => 202,
            Error::DeviceNotFound(_) => 203,

            // Crypto (300-399)
            Error::IntegrityCheckFailed(_) => 300,
            Error::InvalidKey(_) => 301,
            Error::EncryptionFailed(_) => 302,
            Error::KeyDerivationFailed(_) => 303,
            Error::KeyMismatchNeedsSetup { .. } => 304,

            // Storage (400-499)
            Error::StorageUnavailable(_) => 400,
            Error::StorageNotFound(_) => 401,
            Error::StorageCorrupted(_) => 402,
            Error::WeakBackupPassword { .. } => 403,
            Error::BackupDecryptionFailed => 404,

            // Network (500-599)
            Error::NetworkUnavailable(_) => 500,
            Error::Cancelled(_) => 501,

            // Ratchet (600-699)
            Error::RatchetWindowExceeded { .. } => 600,
            Error::RatchetStateCorrupted(_) => 601,
            Error::RatchetNotInitialized(_) => 602,
            Error::RotationRequired(_) => 603,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::InvalidConfig(_) => 901,
            Error::InvalidMessage(_) => 902,
            Error::SerializationError(_) => 903,
            Error::DeserializationError(_) => 904,
        }
    }

    /// Classify this error into the fixed taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedAlgorithm(_) => ErrorKind::UnsupportedAlgorithm,
            Error::NoCompatibleAlgorithm(_) => ErrorKind::NoCompatibleAlgorithm,

            Error::FingerprintConflict(_) => ErrorKind::FingerprintConflict,
            Error::DeviceNotTrusted(_) | Error::DeviceNotFound(_) => ErrorKind::DeviceNotTrusted,
            Error::DeviceRevoked(_) => ErrorKind::DeviceRevoked,

            Error::IntegrityCheckFailed(_)
            | Error::InvalidKey(_)
            | Error::BackupDecryptionFailed
            | Error::DeserializationError(_) => ErrorKind::IntegrityCheckFailed,
            Error::KeyMismatchNeedsSetup { .. } | Error::RatchetNotInitialized(_) => {
                ErrorKind::KeyMismatchNeedsSetup
            }

            Error::StorageUnavailable(_)
            | Error::StorageNotFound(_)
            | Error::StorageCorrupted(_) => ErrorKind::StorageUnavailable,
            Error::WeakBackupPassword { .. } => ErrorKind::WeakBackupPassword,

            Error::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,

            Error::RatchetWindowExceeded { .. } => ErrorKind::RatchetWindowExceeded,
            Error::RatchetStateCorrupted(_) | Error::RotationRequired(_) => {
                ErrorKind::RatchetStateCorrupted
            }

            Error::Cancelled(_)
            | Error::EncryptionFailed(_)
            | Error::KeyDerivationFailed(_)
            | Error::Internal(_)
            | Error::InvalidConfig(_)
            | Error::InvalidMessage(_)
            | Error::SerializationError(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures are retried with backoff by the caller
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_))
    }

    /// Failures that trigger automatic recovery before surfacing
    pub fn is_auto_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::KeyMismatchNeedsSetup | ErrorKind::DeviceNotTrusted
        )
    }

    /// Failures that must be shown to the user as a security warning and are
    /// never resolved silently
    pub fn is_security_warning(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IntegrityCheckFailed
                | ErrorKind::RatchetStateCorrupted
                | ErrorKind::FingerprintConflict
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageUnavailable(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::UnsupportedAlgorithm("x".into()).code(), 100);
        assert_eq!(Error::FingerprintConflict("x".into()).code(), 200);
        assert_eq!(Error::IntegrityCheckFailed("x".into()).code(), 300);
        assert_eq!(Error::StorageUnavailable("x".into()).code(), 400);
        assert_eq!(Error::NetworkUnavailable("x".into()).code(), 500);
        assert_eq!(Error::RatchetStateCorrupted("x".into()).code(), 601);
        assert_eq!(Error::Internal("x".into()).code(), 900);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::BackupDecryptionFailed.kind(),
            ErrorKind::IntegrityCheckFailed
        );
        assert_eq!(
            Error::RotationRequired("conv".into()).kind(),
            ErrorKind::RatchetStateCorrupted
        );
        assert_eq!(
            Error::DeviceNotFound("dev".into()).kind(),
            ErrorKind::DeviceNotTrusted
        );
        assert_eq!(
            Error::KeyMismatchNeedsSetup {
                conversation_id: "c".into(),
                local: Some(1),
                remote: Some(2),
            }
            .kind(),
            ErrorKind::KeyMismatchNeedsSetup
        );
    }

    #[test]
    fn test_propagation_classes() {
        assert!(Error::NetworkUnavailable("down".into()).is_transient());
        assert!(!Error::Cancelled("teardown".into()).is_transient());

        assert!(Error::DeviceNotTrusted("d".into()).is_auto_recoverable());
        assert!(!Error::IntegrityCheckFailed("tag".into()).is_auto_recoverable());

        assert!(Error::IntegrityCheckFailed("tag".into()).is_security_warning());
        assert!(Error::FingerprintConflict("fp".into()).is_security_warning());
        assert!(!Error::NetworkUnavailable("down".into()).is_security_warning());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::WeakBackupPassword { min_length: 12 };
        assert!(err.to_string().contains("12"));

        let err = Error::RatchetWindowExceeded {
            requested: 5000,
            current: 3,
            max_skip: 1000,
        };
        assert!(err.to_string().contains("5000"));
        assert_eq!(ErrorKind::RatchetWindowExceeded.to_string(), "ratchet_window_exceeded");
    }
}
