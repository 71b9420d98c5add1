//! # Conversation Keys
//!
//! Lifecycle of the symmetric key every conversation is encrypted under.
//!
//! ## Versions
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CONVERSATION KEY VERSIONS                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   setup ──► v1 ──rotate──► v2 ──rotate──► v3 ...                       │
//! │                                                                         │
//! │   Every version is:                                                     │
//! │   • a fresh random 256-bit key                                          │
//! │   • wrapped once per trusted participant device (KEM + AEAD)            │
//! │   • persisted locally before the wrapped copies leave the device        │
//! │   • kept in the secure store for historical decryption                  │
//! │                                                                         │
//! │   Rotation triggers: device revoked, user request, policy interval,     │
//! │   compromised ratchet, recovery.                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fetching
//!
//! ```text
//! fetch_or_unwrap(conv)
//!   │
//!   ├─► KeyCache current pointer ─────────────── hit ──► key
//!   │
//!   ├─► directory.fetch_key (retried, cancellable)
//!   │     ├─ none / no copy for this device ──► KeyMismatchNeedsSetup
//!   │     ├─ older than the local version ────► KeyMismatchNeedsSetup
//!   │     └─ same as local ───────────────────► local copy
//!   │
//!   └─► unwrap with the device key (scoped) ──► persist ──► cache ──► key
//! ```
//!
//! Mutating operations take a per-conversation async lock. A caller that
//! waited on an in-flight rotation adopts its result instead of rotating
//! again.

mod directory;

pub use directory::{
    DirectoryDevice, KeyDirectory, KeyDistribution, MemoryDirectory, RemoteKey, WrappedKeyCopy,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::cache::KeyCache;
use crate::config::{RecoveryConfig, RotationConfig, SigilConfig};
use crate::crypto::kdf::derive_media_key;
use crate::crypto::{unwrap_key, wrap_key, Algorithm, KeyPairService, Signed};
use crate::device::{Device, DeviceRegistry};
use crate::error::{Error, Result};
use crate::events::{SecurityEventKind, SecurityEventLog};
use crate::negotiation::{AlgorithmNegotiator, DowngradeConsent, Negotiation};
use crate::recovery::retry_with_backoff;
use crate::storage::{ConversationKeyRecord, SecureKeyStore};

/// Why a conversation key was rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    DeviceRevoked,
    UserRequested,
    PolicyInterval,
    RatchetCompromised,
    Recovery,
}

/// One unwrapped conversation key version
#[derive(Clone)]
pub struct ConversationSecret {
    pub conversation_id: String,
    pub version: u32,
    pub algorithm: Algorithm,
    key: Zeroizing<[u8; 32]>,
}

impl ConversationSecret {
    pub fn new(conversation_id: &str, version: u32, algorithm: Algorithm, key: [u8; 32]) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            version,
            algorithm,
            key: Zeroizing::new(key),
        }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    fn from_record(record: &ConversationKeyRecord) -> Self {
        Self::new(
            &record.conversation_id,
            record.version,
            record.algorithm,
            record.key,
        )
    }

    fn to_record(&self, participants: &[String]) -> ConversationKeyRecord {
        ConversationKeyRecord {
            conversation_id: self.conversation_id.clone(),
            version: self.version,
            algorithm: self.algorithm,
            key: *self.key,
            participants: participants.to_vec(),
            created_at: crate::time::now_timestamp_millis(),
        }
    }
}

impl std::fmt::Debug for ConversationSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSecret")
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A freshly generated key version with its distribution
#[derive(Debug, Clone)]
pub struct ConversationKey {
    pub secret: ConversationSecret,
    pub copies: Vec<WrappedKeyCopy>,
    pub negotiation: Signed<Negotiation>,
    pub reason: Option<RotationReason>,
}

impl ConversationKey {
    pub fn version(&self) -> u32 {
        self.secret.version
    }

    pub fn algorithm(&self) -> Algorithm {
        self.secret.algorithm
    }

    /// Devices that received a wrapped copy
    pub fn recipients(&self) -> Vec<&str> {
        self.copies.iter().map(|c| c.device_id.as_str()).collect()
    }
}

/// Key for one call's media encryption
pub struct MediaKey {
    pub conversation_id: String,
    pub call_id: String,
    pub key_version: u32,
    key: Zeroizing<[u8; 32]>,
}

impl MediaKey {
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaKey")
            .field("conversation_id", &self.conversation_id)
            .field("call_id", &self.call_id)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

struct ConversationInfo {
    /// Devices the conversation is shared with
    participants: Vec<String>,
    algorithm: Algorithm,
    version: u32,
    /// Unix milliseconds of the last setup or rotation
    rotated_at: i64,
    /// Last key this device generated
    latest: Option<ConversationKey>,
}

fn wrap_context(conversation_id: &str, version: u32, device_id: &str) -> Vec<u8> {
    format!("{}|{}|{}", conversation_id, version, device_id).into_bytes()
}

/// Creates, rotates and fetches conversation keys for the local device
pub struct ConversationKeyManager {
    user_id: String,
    device_id: String,
    key_store: SecureKeyStore,
    service: KeyPairService,
    cache: Arc<KeyCache>,
    directory: Arc<dyn KeyDirectory>,
    registry: Arc<DeviceRegistry>,
    negotiator: AlgorithmNegotiator,
    events: SecurityEventLog,
    rotation: RotationConfig,
    recovery: RecoveryConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    conversations: RwLock<HashMap<String, ConversationInfo>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl ConversationKeyManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        key_store: SecureKeyStore,
        registry: Arc<DeviceRegistry>,
        directory: Arc<dyn KeyDirectory>,
        cache: Arc<KeyCache>,
        events: SecurityEventLog,
        config: &SigilConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            key_store,
            service: KeyPairService::new(),
            cache,
            directory,
            registry,
            negotiator: AlgorithmNegotiator::new(config.negotiation.clone(), events.clone()),
            events,
            rotation: config.rotation.clone(),
            recovery: config.recovery.clone(),
            locks: Mutex::new(HashMap::new()),
            conversations: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Rebuild the conversation index from stored key versions
    ///
    /// Conversations already known in memory are left alone. Returns how
    /// many were loaded.
    pub fn load_stored(&self) -> Result<usize> {
        let records = self.key_store.latest_conversation_keys(&self.user_id)?;
        let mut conversations = self.conversations.write();
        let mut loaded = 0;
        for record in &records {
            if conversations.contains_key(&record.conversation_id) {
                continue;
            }
            conversations.insert(
                record.conversation_id.clone(),
                ConversationInfo {
                    participants: record.participants.clone(),
                    algorithm: record.algorithm,
                    version: record.version,
                    rotated_at: record.created_at,
                    latest: None,
                },
            );
            loaded += 1;
        }
        tracing::debug!(user = %self.user_id, conversations = loaded, "Loaded stored conversations");
        Ok(loaded)
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    // ========================================================================
    // SETUP AND ROTATION
    // ========================================================================

    /// Create the first key of a conversation
    ///
    /// The local device is always a participant. Devices that are not
    /// trusted take part in negotiation but receive no wrapped copy.
    pub async fn setup_conversation(
        &self,
        conversation_id: &str,
        participant_devices: &[String],
        consent: Option<&DowngradeConsent>,
    ) -> Result<ConversationKey> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let stored = self
            .key_store
            .latest_conversation_key(&self.user_id, conversation_id)?
            .map(|r| r.version);
        let version = stored.map_or(1, |v| v + 1);

        let mut participants = participant_devices.to_vec();
        if !participants.contains(&self.device_id) {
            participants.push(self.device_id.clone());
        }
        participants.sort();
        participants.dedup();

        let key = self.generate_version(conversation_id, &participants, version, consent, None)?;
        let distribution = self.distribution(&key);

        let directory = &self.directory;
        let body = &distribution;
        self.call_directory(conversation_id, move || directory.setup_encryption(body))
            .await?;

        self.install(conversation_id, participants, &key);
        tracing::info!(
            conversation = conversation_id,
            version,
            algorithm = %key.algorithm(),
            recipients = key.copies.len(),
            "Conversation encryption set up"
        );
        Ok(key)
    }

    /// Generate version N+1 and re-wrap it for the current device set
    ///
    /// Concurrent calls are serialized; a caller that waited while another
    /// rotation completed returns that rotation's key.
    pub async fn rotate(&self, conversation_id: &str, reason: RotationReason) -> Result<ConversationKey> {
        let observed = self.current_version(conversation_id);

        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let (current, latest, participants) = {
            let conversations = self.conversations.read();
            let info = conversations.get(conversation_id).ok_or_else(|| {
                Error::KeyMismatchNeedsSetup {
                    conversation_id: conversation_id.to_string(),
                    local: None,
                    remote: None,
                }
            })?;
            (info.version, info.latest.clone(), info.participants.clone())
        };

        if observed.map_or(false, |v| current > v) {
            if let Some(latest) = latest.filter(|k| k.version() == current) {
                tracing::debug!(
                    conversation = conversation_id,
                    version = current,
                    "Adopted concurrent rotation"
                );
                return Ok(latest);
            }
        }

        let stored = self
            .key_store
            .latest_conversation_key(&self.user_id, conversation_id)?
            .map_or(0, |r| r.version);
        let version = current.max(stored) + 1;

        let participants = self.current_device_set(&participants);
        let key = self.generate_version(conversation_id, &participants, version, None, Some(reason))?;
        let distribution = self.distribution(&key);

        let directory = &self.directory;
        let body = &distribution;
        self.call_directory(conversation_id, move || directory.rotate_key(body))
            .await?;

        self.cache.invalidate_below(conversation_id, version);
        self.install(conversation_id, participants, &key);

        self.events.record(
            Some(conversation_id),
            Some(&self.device_id),
            SecurityEventKind::KeyRotated {
                from_version: current,
                to_version: version,
                reason,
            },
        );
        tracing::info!(
            conversation = conversation_id,
            from = current,
            to = version,
            reason = ?reason,
            "Rotated conversation key"
        );
        Ok(key)
    }

    /// Conversations whose key is older than the rotation interval
    pub fn rotations_due(&self, now_millis: i64) -> Vec<String> {
        let mut due: Vec<String> = self
            .conversations
            .read()
            .iter()
            .filter(|(_, info)| {
                crate::time::has_elapsed(info.rotated_at, now_millis, self.rotation.interval)
            })
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due
    }

    /// Rotate every conversation that is due
    pub async fn rotate_due(&self, now_millis: i64) -> Result<Vec<ConversationKey>> {
        let mut rotated = Vec::new();
        for conversation_id in self.rotations_due(now_millis) {
            rotated.push(self.rotate(&conversation_id, RotationReason::PolicyInterval).await?);
        }
        Ok(rotated)
    }

    /// Conversations a device takes part in
    pub fn conversations_with_device(&self, device_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .read()
            .iter()
            .filter(|(_, info)| info.participants.iter().any(|p| p == device_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // FETCHING
    // ========================================================================

    /// Current key of a conversation
    pub async fn fetch_or_unwrap(&self, conversation_id: &str) -> Result<ConversationSecret> {
        if let Some(secret) = self.cache.get_current(conversation_id) {
            return Ok(secret);
        }

        let directory = &self.directory;
        let device_id = self.device_id.as_str();
        let remote = self
            .call_directory(conversation_id, move || {
                directory.fetch_key(conversation_id, device_id, None)
            })
            .await?;

        let local = self
            .key_store
            .latest_conversation_key(&self.user_id, conversation_id)?;
        let local_version = local.as_ref().map(|r| r.version);

        let Some(remote) = remote else {
            return Err(Error::KeyMismatchNeedsSetup {
                conversation_id: conversation_id.to_string(),
                local: local_version,
                remote: None,
            });
        };

        let secret = match local {
            Some(record) if record.version == remote.version => ConversationSecret::from_record(&record),
            Some(record) if record.version > remote.version => {
                tracing::warn!(
                    conversation = conversation_id,
                    local = record.version,
                    remote = remote.version,
                    "Directory serves an older key version"
                );
                return Err(Error::KeyMismatchNeedsSetup {
                    conversation_id: conversation_id.to_string(),
                    local: Some(record.version),
                    remote: Some(remote.version),
                });
            }
            _ => self.unwrap_remote(&remote, local_version)?,
        };

        self.cache.insert(secret.clone(), true);
        self.adopt(&remote, &secret);
        Ok(secret)
    }

    /// Key of an older version, for decrypting history
    pub async fn historical_key(&self, conversation_id: &str, version: u32) -> Result<ConversationSecret> {
        if let Some(secret) = self.cache.get(conversation_id, version) {
            return Ok(secret);
        }

        if let Some(record) = self
            .key_store
            .get_conversation_key(&self.user_id, conversation_id, version)?
        {
            let secret = ConversationSecret::from_record(&record);
            self.cache.insert(secret.clone(), false);
            return Ok(secret);
        }

        let local_version = self
            .key_store
            .latest_conversation_key(&self.user_id, conversation_id)?
            .map(|r| r.version);

        let directory = &self.directory;
        let device_id = self.device_id.as_str();
        let remote = self
            .call_directory(conversation_id, move || {
                directory.fetch_key(conversation_id, device_id, Some(version))
            })
            .await?
            .ok_or_else(|| Error::KeyMismatchNeedsSetup {
                conversation_id: conversation_id.to_string(),
                local: local_version,
                remote: None,
            })?;

        let secret = self.unwrap_remote(&remote, local_version)?;
        self.cache.insert(secret.clone(), false);
        Ok(secret)
    }

    /// Media key for a call, derived from the current conversation key
    pub async fn media_key(&self, conversation_id: &str, call_id: &str) -> Result<MediaKey> {
        let secret = self.fetch_or_unwrap(conversation_id).await?;
        let key = derive_media_key(secret.key(), conversation_id, call_id, secret.version)?;
        Ok(MediaKey {
            conversation_id: conversation_id.to_string(),
            call_id: call_id.to_string(),
            key_version: secret.version,
            key: Zeroizing::new(key),
        })
    }

    pub fn current_version(&self, conversation_id: &str) -> Option<u32> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|info| info.version)
    }

    pub fn algorithm(&self, conversation_id: &str) -> Option<Algorithm> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|info| info.algorithm)
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Cancel in-flight directory calls for a conversation
    pub fn cancel(&self, conversation_id: &str) {
        if let Some(token) = self.tokens.lock().remove(conversation_id) {
            token.cancel();
        }
    }

    /// Cancel pending work and drop cached state; stored versions remain
    pub fn teardown(&self, conversation_id: &str) {
        self.cancel(conversation_id);
        self.cache.invalidate_conversation(conversation_id);
        self.conversations.write().remove(conversation_id);
        self.locks.lock().remove(conversation_id);
        tracing::info!(conversation = conversation_id, "Conversation torn down");
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn lock_for(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn token_for(&self, conversation_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Directory call with transient retries, abandoned on teardown
    async fn call_directory<T, F, Fut>(&self, conversation_id: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.token_for(conversation_id);
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!(
                "Directory call for {} abandoned",
                conversation_id
            ))),
            result = retry_with_backoff(&self.recovery, op) => result,
        }
    }

    /// Participants plus every other non-revoked device of their users
    fn current_device_set(&self, participants: &[String]) -> Vec<String> {
        let mut users: Vec<String> = participants
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|d| d.user_id)
            .collect();
        users.sort();
        users.dedup();

        let mut devices: Vec<String> = participants
            .iter()
            .filter(|id| self.registry.get(id).map_or(false, |d| !d.is_revoked()))
            .cloned()
            .collect();
        for user in &users {
            devices.extend(
                self.registry
                    .devices_for_user(user)
                    .into_iter()
                    .filter(|d| !d.is_revoked())
                    .map(|d| d.id),
            );
        }
        devices.sort();
        devices.dedup();
        devices
    }

    fn generate_version(
        &self,
        conversation_id: &str,
        participants: &[String],
        version: u32,
        consent: Option<&DowngradeConsent>,
        reason: Option<RotationReason>,
    ) -> Result<ConversationKey> {
        let devices: Vec<Device> = participants
            .iter()
            .map(|id| self.registry.require(id))
            .collect::<Result<_>>()?;

        let negotiation = self.key_store.with_private_key(&self.user_id, |keys| {
            self.negotiator
                .negotiate(conversation_id, &devices, consent, keys.signing())
        })?;
        let algorithm = negotiation.data.algorithm;

        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *key);

        let mut copies = Vec::new();
        for device in &devices {
            if !negotiation.data.participants.contains(&device.id) {
                continue;
            }
            if !device.trust.receives_keys() {
                tracing::debug!(
                    conversation = conversation_id,
                    device = %device.id,
                    trust = ?device.trust,
                    "Skipping untrusted device"
                );
                continue;
            }
            let wrapped = wrap_key(
                &self.service,
                &device.public_keys,
                algorithm,
                &key,
                &wrap_context(conversation_id, version, &device.id),
            )?;
            copies.push(WrappedKeyCopy {
                device_id: device.id.clone(),
                device_public_key: device.signing_public_key,
                wrapped,
            });
        }

        let secret = ConversationSecret::new(conversation_id, version, algorithm, *key);
        self.key_store
            .store_conversation_key(&self.user_id, &secret.to_record(participants))?;

        Ok(ConversationKey {
            secret,
            copies,
            negotiation,
            reason,
        })
    }

    fn distribution(&self, key: &ConversationKey) -> KeyDistribution {
        KeyDistribution {
            conversation_id: key.secret.conversation_id.clone(),
            version: key.version(),
            algorithm: key.algorithm(),
            copies: key.copies.clone(),
            reason: key.reason,
            negotiation: key.negotiation.clone(),
            created_by: self.device_id.clone(),
            created_at: crate::time::now_timestamp_millis(),
        }
    }

    fn install(&self, conversation_id: &str, participants: Vec<String>, key: &ConversationKey) {
        self.cache.insert(key.secret.clone(), true);
        self.conversations.write().insert(
            conversation_id.to_string(),
            ConversationInfo {
                participants,
                algorithm: key.algorithm(),
                version: key.version(),
                rotated_at: crate::time::now_timestamp_millis(),
                latest: Some(key.clone()),
            },
        );
    }

    /// Record a version learned from the directory
    fn adopt(&self, remote: &RemoteKey, secret: &ConversationSecret) {
        let mut conversations = self.conversations.write();
        let info = conversations
            .entry(remote.conversation_id.clone())
            .or_insert_with(|| ConversationInfo {
                participants: Vec::new(),
                algorithm: secret.algorithm,
                version: 0,
                rotated_at: crate::time::now_timestamp_millis(),
                latest: None,
            });
        if secret.version > info.version {
            info.version = secret.version;
            info.algorithm = secret.algorithm;
            info.rotated_at = crate::time::now_timestamp_millis();
            // A newer version's device set replaces the old one
            info.participants = remote.participants.clone();
        } else if secret.version == info.version {
            for participant in &remote.participants {
                if !info.participants.contains(participant) {
                    info.participants.push(participant.clone());
                }
            }
        }
    }

    fn unwrap_remote(&self, remote: &RemoteKey, local_version: Option<u32>) -> Result<ConversationSecret> {
        let wrapped = remote.wrapped.as_ref().ok_or_else(|| {
            tracing::warn!(
                conversation = %remote.conversation_id,
                version = remote.version,
                "No wrapped key for this device"
            );
            Error::KeyMismatchNeedsSetup {
                conversation_id: remote.conversation_id.clone(),
                local: local_version,
                remote: Some(remote.version),
            }
        })?;

        let context = wrap_context(&remote.conversation_id, remote.version, &self.device_id);
        let key = self.key_store.with_private_key(&self.user_id, |keys| {
            unwrap_key(&self.service, wrapped, keys.private_bundle(), &context)
        })?;

        let secret = ConversationSecret::new(&remote.conversation_id, remote.version, remote.algorithm, *key);
        self.key_store
            .store_conversation_key(&self.user_id, &secret.to_record(&remote.participants))?;
        tracing::debug!(
            conversation = %remote.conversation_id,
            version = remote.version,
            "Unwrapped conversation key"
        );
        Ok(secret)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::{CapabilitySet, DeviceKeys};
    use crate::device::{DeviceKind, DeviceRegistration, Verification};

    struct Peer {
        manager: Arc<ConversationKeyManager>,
        registry: Arc<DeviceRegistry>,
        device_id: String,
        events: SecurityEventLog,
    }

    fn registration(user: &str, device_id: &str, keys: &DeviceKeys) -> DeviceRegistration {
        DeviceRegistration {
            device_id: Some(device_id.to_string()),
            user_id: user.to_string(),
            name: device_id.to_string(),
            kind: DeviceKind::Desktop,
            signing_public_key: keys.signing().public_bytes(),
            public_keys: keys.public_bundle().clone(),
            capabilities: keys.capabilities(),
            hardware_attributes: None,
        }
    }

    fn peer(user: &str, device_id: &str, keys: &DeviceKeys, directory: Arc<MemoryDirectory>) -> Peer {
        let mut config = SigilConfig::default();
        config.recovery.retry_base_delay = Duration::from_millis(1);
        config.recovery.retry_max_delay = Duration::from_millis(5);

        let store = SecureKeyStore::in_memory(SigilConfig::fast_kdf().backup);
        store.store_private_key(user, keys).unwrap();
        let registry = Arc::new(DeviceRegistry::new(user));
        registry.register(registration(user, device_id, keys)).unwrap();

        let events = SecurityEventLog::new();
        let manager = Arc::new(ConversationKeyManager::new(
            user,
            device_id,
            store,
            registry.clone(),
            directory,
            Arc::new(KeyCache::from_config(&config.cache)),
            events.clone(),
            &config,
        ));
        Peer {
            manager,
            registry,
            device_id: device_id.to_string(),
            events,
        }
    }

    /// Make `device` known and trusted in `peer`'s registry
    fn introduce(peer: &Peer, user: &str, device_id: &str, keys: &DeviceKeys) {
        let device = peer
            .registry
            .register(registration(user, device_id, keys))
            .unwrap()
            .into_device();
        peer.registry
            .trust(device_id, Some(&Verification::new(device.fingerprint)))
            .unwrap();
    }

    fn keys() -> DeviceKeys {
        DeviceKeys::generate(&KeyPairService::new(), &CapabilitySet::all()).unwrap()
    }

    fn alice_and_bob() -> (Peer, Peer, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        let alice_keys = keys();
        let bob_keys = keys();
        let alice = peer("alice", "alice-laptop", &alice_keys, directory.clone());
        let bob = peer("bob", "bob-phone", &bob_keys, directory.clone());
        introduce(&alice, "bob", "bob-phone", &bob_keys);
        introduce(&bob, "alice", "alice-laptop", &alice_keys);
        (alice, bob, directory)
    }

    fn both() -> Vec<String> {
        vec!["alice-laptop".to_string(), "bob-phone".to_string()]
    }

    #[tokio::test]
    async fn test_setup_and_fetch() {
        let (alice, bob, directory) = alice_and_bob();

        let key = alice.manager.setup_conversation("conv", &both(), None).await.unwrap();
        assert_eq!(key.version(), 1);
        assert_eq!(key.algorithm(), Algorithm::X25519Kyber768Aes256Gcm);
        assert_eq!(key.recipients(), vec!["alice-laptop", "bob-phone"]);
        assert_eq!(directory.current_version("conv"), Some(1));

        let secret = bob.manager.fetch_or_unwrap("conv").await.unwrap();
        assert_eq!(secret.version, 1);
        assert_eq!(secret.key(), key.secret.key());
        assert_eq!(bob.manager.current_version("conv"), Some(1));
    }

    #[tokio::test]
    async fn test_untrusted_device_gets_no_copy() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice_keys = keys();
        let mallory_keys = keys();
        let alice = peer("alice", "alice-laptop", &alice_keys, directory.clone());
        let mallory = peer("mallory", "mallory-web", &mallory_keys, directory.clone());
        alice
            .registry
            .register(registration("mallory", "mallory-web", &mallory_keys))
            .unwrap();

        let participants = vec!["alice-laptop".to_string(), "mallory-web".to_string()];
        let key = alice
            .manager
            .setup_conversation("conv", &participants, None)
            .await
            .unwrap();
        assert_eq!(key.recipients(), vec!["alice-laptop"]);

        let err = mallory.manager.fetch_or_unwrap("conv").await.unwrap_err();
        assert!(matches!(
            err,
            Error::KeyMismatchNeedsSetup { local: None, remote: Some(1), .. }
        ));
        assert_eq!(mallory.device_id, "mallory-web");
    }

    #[tokio::test]
    async fn test_fetch_unknown_conversation() {
        let (_, bob, _) = alice_and_bob();
        let err = bob.manager.fetch_or_unwrap("missing").await.unwrap_err();
        assert!(matches!(
            err,
            Error::KeyMismatchNeedsSetup { local: None, remote: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_rotation_keeps_history_and_invalidates_cache() {
        let (alice, bob, _) = alice_and_bob();
        let v1 = alice.manager.setup_conversation("conv", &both(), None).await.unwrap();
        bob.manager.fetch_or_unwrap("conv").await.unwrap();

        let v2 = alice.manager.rotate("conv", RotationReason::UserRequested).await.unwrap();
        assert_eq!(v2.version(), 2);
        assert_ne!(v1.secret.key(), v2.secret.key());

        // Bob still has v1 cached as current until told otherwise
        bob.manager.cache().invalidate_conversation("conv");
        let fetched = bob.manager.fetch_or_unwrap("conv").await.unwrap();
        assert_eq!(fetched.version, 2);

        let old = bob.manager.historical_key("conv", 1).await.unwrap();
        assert_eq!(old.key(), v1.secret.key());

        assert!(alice.manager.cache().get("conv", 1).is_none());
        assert_eq!(alice.manager.cache().get_current("conv").unwrap().version, 2);
        assert_eq!(
            alice.events.count(|e| matches!(e.kind, SecurityEventKind::KeyRotated { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_rotations_share_result() {
        let (alice, _, directory) = alice_and_bob();
        alice.manager.setup_conversation("conv", &both(), None).await.unwrap();
        directory.set_latency(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            alice.manager.rotate("conv", RotationReason::UserRequested),
            alice.manager.rotate("conv", RotationReason::UserRequested),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.version(), 2);
        assert_eq!(b.version(), 2);
        assert_eq!(a.secret.key(), b.secret.key());
        assert_eq!(directory.current_version("conv"), Some(2));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (alice, _, directory) = alice_and_bob();
        directory.fail_next(2);
        let key = alice.manager.setup_conversation("conv", &both(), None).await.unwrap();
        assert_eq!(key.version(), 1);
        assert_eq!(directory.calls(), 3);
    }

    #[tokio::test]
    async fn test_teardown_cancels_directory_wait() {
        let (alice, _, directory) = alice_and_bob();
        directory.set_latency(Duration::from_secs(5));

        let manager = alice.manager.clone();
        let pending = tokio::spawn(async move { manager.fetch_or_unwrap("conv").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        alice.manager.teardown("conv");

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_revoked_device_excluded_on_rotation() {
        let (alice, _, directory) = alice_and_bob();
        alice.manager.setup_conversation("conv", &both(), None).await.unwrap();
        assert_eq!(alice.manager.conversations_with_device("bob-phone"), vec!["conv"]);

        alice.registry.revoke("bob-phone", "lost").unwrap();
        let key = alice.manager.rotate("conv", RotationReason::DeviceRevoked).await.unwrap();
        assert_eq!(key.recipients(), vec!["alice-laptop"]);
        assert!(alice.manager.conversations_with_device("bob-phone").is_empty());

        let remote = directory.fetch_key("conv", "bob-phone", None).await.unwrap().unwrap();
        assert_eq!(remote.version, 2);
        assert!(remote.wrapped.is_none());
    }

    #[tokio::test]
    async fn test_restarted_manager_still_rotates_out_revoked_device() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice_keys = keys();
        let bob_keys = keys();
        let alice = peer("alice", "alice-laptop", &alice_keys, directory.clone());
        introduce(&alice, "bob", "bob-phone", &bob_keys);
        alice.manager.setup_conversation("conv", &both(), None).await.unwrap();

        // Same store and registry, fresh in-memory index
        let config = SigilConfig::fast_kdf();
        let restarted = ConversationKeyManager::new(
            "alice",
            "alice-laptop",
            alice.manager.key_store.clone(),
            alice.registry.clone(),
            directory.clone(),
            Arc::new(KeyCache::from_config(&config.cache)),
            SecurityEventLog::new(),
            &config,
        );
        assert!(restarted.conversations_with_device("bob-phone").is_empty());

        assert_eq!(restarted.load_stored().unwrap(), 1);
        assert_eq!(restarted.load_stored().unwrap(), 0);
        assert_eq!(restarted.current_version("conv"), Some(1));
        assert_eq!(restarted.conversations_with_device("bob-phone"), vec!["conv"]);

        alice.registry.revoke("bob-phone", "lost").unwrap();
        let key = restarted.rotate("conv", RotationReason::DeviceRevoked).await.unwrap();
        assert_eq!(key.version(), 2);
        assert_eq!(key.recipients(), vec!["alice-laptop"]);
        assert_eq!(directory.current_version("conv"), Some(2));
    }

    #[tokio::test]
    async fn test_rotations_due_and_media_key() {
        let (alice, _, _) = alice_and_bob();
        alice.manager.setup_conversation("conv", &both(), None).await.unwrap();

        let now = crate::time::now_timestamp_millis();
        assert!(alice.manager.rotations_due(now).is_empty());
        let later = now + Duration::from_secs(8 * 24 * 60 * 60).as_millis() as i64;
        assert_eq!(alice.manager.rotations_due(later), vec!["conv"]);

        let rotated = alice.manager.rotate_due(later).await.unwrap();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].reason, Some(RotationReason::PolicyInterval));

        let media = alice.manager.media_key("conv", "call-1").await.unwrap();
        let other = alice.manager.media_key("conv", "call-2").await.unwrap();
        assert_eq!(media.key_version, 2);
        assert_ne!(media.key(), other.key());
    }
}
