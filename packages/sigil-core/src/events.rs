//! # Security Events
//!
//! Append-only audit log of security-relevant state changes. Recovery reads
//! it to count failures; hosts read it to show warnings.
//!
//! | Kind | Recorded by |
//! |------|-------------|
//! | `KeyRotated` | ConversationKeyManager on every new version |
//! | `DecryptionFailed` | Session decrypt path |
//! | `DeviceRevoked` | Session on revocation |
//! | `AlgorithmDowngrade` | Negotiator when consent was used |
//! | `RecoveryAttempted` | Recovery coordinator, success or not |
//! | `RatchetCompromised` | Ratchet on message number reuse |
//! | `MessageUndecryptable` / `MessageUndeliverable` | Recovery on unrecoverable errors |

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::RotationReason;
use crate::crypto::Algorithm;
use crate::error::ErrorKind;
use crate::recovery::RecoveryStrategy;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEventKind {
    KeyRotated {
        from_version: u32,
        to_version: u32,
        reason: RotationReason,
    },
    DecryptionFailed {
        error: ErrorKind,
        key_version: Option<u32>,
    },
    DeviceRevoked {
        reason: String,
    },
    AlgorithmDowngrade {
        algorithm: Algorithm,
        excluded_devices: Vec<String>,
    },
    RecoveryAttempted {
        strategy: RecoveryStrategy,
        success: bool,
        error: ErrorKind,
    },
    RatchetCompromised {
        key_version: u32,
    },
    MessageUndecryptable {
        message_id: Option<String>,
        error: ErrorKind,
    },
    MessageUndeliverable {
        error: ErrorKind,
    },
}

impl SecurityEventKind {
    /// Whether the host should surface this event as a warning
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            SecurityEventKind::AlgorithmDowngrade { .. }
                | SecurityEventKind::RatchetCompromised { .. }
                | SecurityEventKind::MessageUndecryptable { .. }
                | SecurityEventKind::MessageUndeliverable { .. }
        ) || matches!(
            self,
            SecurityEventKind::DecryptionFailed { error, .. }
                if matches!(error, ErrorKind::IntegrityCheckFailed | ErrorKind::RatchetStateCorrupted)
        )
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    /// Unix milliseconds
    pub at: i64,
    pub conversation_id: Option<String>,
    pub device_id: Option<String>,
    pub kind: SecurityEventKind,
}

/// Shared, append-only event log
///
/// Cloning yields another handle to the same log.
#[derive(Debug, Clone, Default)]
pub struct SecurityEventLog {
    events: Arc<RwLock<Vec<SecurityEvent>>>,
}

impl SecurityEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn record(
        &self,
        conversation_id: Option<&str>,
        device_id: Option<&str>,
        kind: SecurityEventKind,
    ) -> SecurityEvent {
        let event = SecurityEvent {
            id: Uuid::new_v4().to_string(),
            at: crate::time::now_timestamp_millis(),
            conversation_id: conversation_id.map(str::to_string),
            device_id: device_id.map(str::to_string),
            kind,
        };

        if event.kind.is_warning() {
            tracing::warn!(
                conversation = ?event.conversation_id,
                device = ?event.device_id,
                "Security event: {:?}",
                event.kind
            );
        } else {
            tracing::info!(
                conversation = ?event.conversation_id,
                device = ?event.device_id,
                "Security event: {:?}",
                event.kind
            );
        }

        self.events.write().push(event.clone());
        event
    }

    /// Snapshot of every event in append order
    pub fn all(&self) -> Vec<SecurityEvent> {
        self.events.read().clone()
    }

    /// Events for one conversation in append order
    pub fn for_conversation(&self, conversation_id: &str) -> Vec<SecurityEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.conversation_id.as_deref() == Some(conversation_id))
            .cloned()
            .collect()
    }

    /// Number of events matching a predicate
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SecurityEvent) -> bool,
    {
        self.events.read().iter().filter(|e| predicate(e)).count()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
