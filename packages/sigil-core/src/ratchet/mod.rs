//! # Message Ratchet
//!
//! Derives one single-use key per message from a conversation key version.
//!
//! ## Key Schedule
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           KEY SCHEDULE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  conversation key (version v)                                           │
//! │        │ HKDF(conversation id, "ratchet-root" || v)                     │
//! │        ▼                                                                │
//! │  root key ──HKDF(sender device id)──► chain key₀ (one chain per sender)│
//! │                                            │                            │
//! │                          ┌─────────────────┼─────────────────┐          │
//! │                          ▼                 ▼                 ▼          │
//! │                HMAC(ck₀,"message")  HMAC(ck₀,"chain")                   │
//! │                   message key₀      chain key₁ ──► ...                  │
//! │                                                                         │
//! │  Each step overwrites the chain key, so a captured chain key cannot be │
//! │  walked backwards to earlier message keys.                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized ──initialize──► Established ──derive──► Advancing
//!                                     │                     │
//!                                     └──── replay seen ────┴──► Compromised
//! ```
//!
//! A `Compromised` state refuses to send until a rotation initializes a
//! newer key version.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::config::RatchetConfig;
use crate::crypto::kdf::{derive_chain_seed, derive_root_key};
use crate::error::{Error, Result};
use crate::events::{SecurityEventKind, SecurityEventLog};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A key for exactly one envelope
///
/// Not `Clone`; zeroized when dropped.
pub struct MessageKey {
    key: [u8; 32],
    message_number: u32,
}

impl MessageKey {
    pub fn message_number(&self) -> u32 {
        self.message_number
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("message_number", &self.message_number)
            .finish_non_exhaustive()
    }
}

/// Ratchet position carried in every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    pub sender_device_id: String,
    pub key_version: u32,
    pub message_number: u32,
    /// Messages sent on the sender's chain under the previous key version
    pub previous_chain_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatchetPhase {
    Uninitialized,
    Established,
    Advancing,
    Compromised,
}

/// Forward-only HMAC chain
struct Chain {
    key: [u8; 32],
    /// Number of the next message key this chain yields
    next: u32,
}

impl Chain {
    fn new(seed: [u8; 32]) -> Self {
        Self { key: seed, next: 0 }
    }

    fn hmac(&self, label: &[u8]) -> Result<[u8; 32]> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::KeyDerivationFailed(format!("HMAC init failed: {}", e)))?;
        mac.update(label);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    fn advance(&mut self) -> Result<MessageKey> {
        if self.next == u32::MAX {
            return Err(Error::RatchetStateCorrupted("Message number overflow".into()));
        }

        let key = self.hmac(MESSAGE_LABEL)?;
        let next_chain = self.hmac(CHAIN_LABEL)?;

        self.key.zeroize();
        self.key = next_chain;

        let message_number = self.next;
        self.next += 1;
        Ok(MessageKey {
            key,
            message_number,
        })
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

struct RatchetState {
    key_version: u32,
    root_key: Zeroizing<[u8; 32]>,
    sending: Chain,
    receiving: HashMap<String, Chain>,
    previous_chain_length: u32,
    /// (sender, message number) → key, oldest first in `skipped_order`
    skipped: HashMap<(String, u32), MessageKey>,
    skipped_order: VecDeque<(String, u32)>,
    phase: RatchetPhase,
}

impl RatchetState {
    fn store_skipped(&mut self, sender: &str, key: MessageKey, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.skipped.len() >= limit {
            match self.skipped_order.pop_front() {
                Some(oldest) => {
                    self.skipped.remove(&oldest);
                }
                None => break,
            }
        }
        let id = (sender.to_string(), key.message_number);
        self.skipped_order.push_back(id.clone());
        self.skipped.insert(id, key);
    }

    fn take_skipped(&mut self, sender: &str, message_number: u32) -> Option<MessageKey> {
        let id = (sender.to_string(), message_number);
        let key = self.skipped.remove(&id)?;
        self.skipped_order.retain(|k| k != &id);
        Some(key)
    }
}

type SharedState = Arc<Mutex<RatchetState>>;

/// Ratchet states of the local device, keyed by conversation and version
///
/// The map lock is only held to look a state up; each state has its own
/// lock, so derivations in different conversations do not wait on each other.
pub struct RatchetEngine {
    local_device_id: String,
    config: RatchetConfig,
    events: SecurityEventLog,
    states: RwLock<HashMap<(String, u32), SharedState>>,
    /// Newest initialized version per conversation; sends use it
    current: Mutex<HashMap<String, u32>>,
}

impl RatchetEngine {
    pub fn new(local_device_id: impl Into<String>, config: RatchetConfig, events: SecurityEventLog) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            config,
            events,
            states: RwLock::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Set up the state for one conversation key version
    ///
    /// Initializing a version that already exists is a no-op. A newer
    /// version becomes the sending version and records how far the previous
    /// sending chain got.
    pub fn initialize(&self, conversation_id: &str, key_version: u32, conversation_key: &[u8; 32]) -> Result<()> {
        let root_key = Zeroizing::new(derive_root_key(conversation_key, conversation_id, key_version)?);
        let seed = derive_chain_seed(&root_key, &self.local_device_id)?;

        let mut states = self.states.write();
        let key = (conversation_id.to_string(), key_version);
        if states.contains_key(&key) {
            return Ok(());
        }

        let mut current = self.current.lock();
        let previous = current.get(conversation_id).copied();
        let previous_chain_length = previous
            .filter(|v| *v < key_version)
            .and_then(|v| states.get(&(conversation_id.to_string(), v)))
            .map(|s| s.lock().sending.next)
            .unwrap_or(0);

        states.insert(
            key,
            Arc::new(Mutex::new(RatchetState {
                key_version,
                root_key,
                sending: Chain::new(seed),
                receiving: HashMap::new(),
                previous_chain_length,
                skipped: HashMap::new(),
                skipped_order: VecDeque::new(),
                phase: RatchetPhase::Established,
            })),
        );

        if previous.map_or(true, |v| v < key_version) {
            current.insert(conversation_id.to_string(), key_version);
        }

        tracing::debug!(
            conversation = conversation_id,
            version = key_version,
            previous_chain_length,
            "Ratchet initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self, conversation_id: &str, key_version: u32) -> bool {
        self.states
            .read()
            .contains_key(&(conversation_id.to_string(), key_version))
    }

    fn state(&self, conversation_id: &str, key_version: u32) -> Option<SharedState> {
        self.states
            .read()
            .get(&(conversation_id.to_string(), key_version))
            .cloned()
    }

    /// Version sends currently use
    pub fn current_version(&self, conversation_id: &str) -> Option<u32> {
        self.current.lock().get(conversation_id).copied()
    }

    /// Phase of the sending state
    pub fn phase(&self, conversation_id: &str) -> RatchetPhase {
        let Some(version) = self.current_version(conversation_id) else {
            return RatchetPhase::Uninitialized;
        };
        self.state(conversation_id, version)
            .map(|s| s.lock().phase)
            .unwrap_or(RatchetPhase::Uninitialized)
    }

    /// Next sending key
    ///
    /// Message numbers strictly increase; no key is ever returned twice.
    pub fn derive_send_key(&self, conversation_id: &str) -> Result<(MessageKey, RatchetHeader)> {
        let version = self
            .current_version(conversation_id)
            .ok_or_else(|| Error::RatchetNotInitialized(conversation_id.to_string()))?;

        let shared = self
            .state(conversation_id, version)
            .ok_or_else(|| Error::RatchetNotInitialized(conversation_id.to_string()))?;
        let mut state = shared.lock();

        if state.phase == RatchetPhase::Compromised {
            return Err(Error::RatchetStateCorrupted(format!(
                "Conversation {} version {} is compromised; rotate before sending",
                conversation_id, version
            )));
        }

        let key = state.sending.advance()?;
        state.phase = RatchetPhase::Advancing;

        let header = RatchetHeader {
            sender_device_id: self.local_device_id.clone(),
            key_version: state.key_version,
            message_number: key.message_number,
            previous_chain_length: state.previous_chain_length,
        };
        Ok((key, header))
    }

    /// Key for a received message
    ///
    /// ## Errors
    ///
    /// - `RatchetNotInitialized` if the header's key version is unknown
    /// - `RatchetWindowExceeded` if the jump exceeds `max_skip`
    /// - `RatchetStateCorrupted` if the message number was already consumed;
    ///   the state becomes `Compromised`
    pub fn derive_receive_key(&self, conversation_id: &str, header: &RatchetHeader) -> Result<MessageKey> {
        let shared = self
            .state(conversation_id, header.key_version)
            .ok_or_else(|| Error::RatchetNotInitialized(conversation_id.to_string()))?;
        let mut guard = shared.lock();
        let state = &mut *guard;

        let sender = header.sender_device_id.as_str();
        if let Some(key) = state.take_skipped(sender, header.message_number) {
            tracing::debug!(
                conversation = conversation_id,
                sender,
                message_number = header.message_number,
                "Used skipped message key"
            );
            return Ok(key);
        }

        if !state.receiving.contains_key(sender) {
            let seed = derive_chain_seed(&state.root_key, sender)?;
            state.receiving.insert(sender.to_string(), Chain::new(seed));
        }
        let next = state.receiving.get(sender).map(|c| c.next).unwrap_or(0);

        if header.message_number < next {
            state.phase = RatchetPhase::Compromised;
            let version = state.key_version;
            drop(guard);
            self.events.record(
                Some(conversation_id),
                Some(sender),
                SecurityEventKind::RatchetCompromised { key_version: version },
            );
            return Err(Error::RatchetStateCorrupted(format!(
                "Message {} from {} was already consumed",
                header.message_number, sender
            )));
        }

        let gap = header.message_number - next;
        if gap > self.config.max_skip {
            return Err(Error::RatchetWindowExceeded {
                requested: header.message_number,
                current: next,
                max_skip: self.config.max_skip,
            });
        }

        let mut skipped = Vec::with_capacity(gap as usize);
        let key = {
            let chain = state
                .receiving
                .get_mut(sender)
                .ok_or_else(|| Error::Internal("Receiving chain vanished".into()))?;
            loop {
                let key = chain.advance()?;
                if key.message_number == header.message_number {
                    break key;
                }
                skipped.push(key);
            }
        };
        for skipped_key in skipped {
            state.store_skipped(sender, skipped_key, self.config.max_skipped_keys);
        }
        if state.phase == RatchetPhase::Established {
            state.phase = RatchetPhase::Advancing;
        }
        Ok(key)
    }

    /// Drop receiving chains and skipped keys of a revoked device
    pub fn terminate_device(&self, device_id: &str) -> usize {
        let states = self.states.read();
        let mut removed = 0;
        for shared in states.values() {
            let mut state = shared.lock();
            if state.receiving.remove(device_id).is_some() {
                removed += 1;
            }
            state.skipped.retain(|(sender, _), _| sender != device_id);
            state.skipped_order.retain(|(sender, _)| sender != device_id);
        }
        tracing::info!(device = device_id, chains = removed, "Terminated ratchet sessions");
        removed
    }

    /// Forget every state of a conversation
    pub fn teardown(&self, conversation_id: &str) {
        self.states.write().retain(|(c, _), _| c != conversation_id);
        self.current.lock().remove(conversation_id);
        tracing::debug!(conversation = conversation_id, "Ratchet torn down");
    }

    /// Skipped keys currently retained for a conversation version
    pub fn skipped_keys(&self, conversation_id: &str, key_version: u32) -> usize {
        self.state(conversation_id, key_version)
            .map(|s| s.lock().skipped.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
