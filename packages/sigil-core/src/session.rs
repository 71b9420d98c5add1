//! # Session
//!
//! One local device with every component wired together.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SIGIL SESSION                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  bootstrap ──► device keys (store) ──► registry ──► directory          │
//! │                                                                         │
//! │  encrypt / decrypt                                                      │
//! │    │                                                                    │
//! │    ├─► EncryptionCodec ──► ConversationKeyManager ──► KeyCache          │
//! │    │         │                     │                                    │
//! │    │         └─► RatchetEngine     └─► KeyDirectory                     │
//! │    │                                                                    │
//! │    └─ on failure ──► ErrorRecoveryCoordinator ──► RecoveryActions       │
//! │                                         (implemented by the session)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A session is the single logical actor for its device. Other devices,
//! including other devices of the same user, are separate sessions that
//! share nothing but the directory.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;

use crate::cache::{AutotuneHandle, CacheTuning, KeyCache, PerformanceOptimizer};
use crate::codec::{EncryptionCodec, Envelope};
use crate::config::SigilConfig;
use crate::conversation::{ConversationKey, ConversationKeyManager, KeyDirectory, MediaKey, RotationReason};
use crate::crypto::kdf::compute_device_fingerprint;
use crate::crypto::{CapabilitySet, DeviceKeys, KeyPairService};
use crate::device::{Device, DeviceKind, DeviceRegistration, DeviceRegistry, Verification};
use crate::error::{Error, Result};
use crate::events::{SecurityEventKind, SecurityEventLog};
use crate::negotiation::DowngradeConsent;
use crate::ratchet::RatchetEngine;
use crate::recovery::{
    retry_with_backoff, ErrorContext, ErrorRecoveryCoordinator, Operation, RecoveryActions,
};
use crate::storage::{RestoreSummary, SecureKeyStore};

/// Hex characters of the fingerprint used as the device id
const DEVICE_ID_LENGTH: usize = 16;

/// What a device says about itself at bootstrap
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: String,
    pub kind: DeviceKind,
    /// Algorithms this device is willing to use
    pub capabilities: CapabilitySet,
    pub hardware_attributes: Option<String>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, kind: DeviceKind, capabilities: CapabilitySet) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities,
            hardware_attributes: None,
        }
    }
}

/// End-to-end encryption for one local device
pub struct SigilSession {
    user_id: String,
    device_id: String,
    config: SigilConfig,
    key_store: SecureKeyStore,
    directory: Arc<dyn KeyDirectory>,
    registry: Arc<DeviceRegistry>,
    keys: Arc<ConversationKeyManager>,
    ratchet: Arc<RatchetEngine>,
    codec: EncryptionCodec,
    optimizer: Arc<PerformanceOptimizer>,
    recovery: ErrorRecoveryCoordinator,
    events: SecurityEventLog,
    /// Other users whose devices this session keeps in sync
    known_users: Mutex<BTreeSet<String>>,
    autotune: Mutex<Option<AutotuneHandle>>,
}

impl SigilSession {
    // ========================================================================
    // BOOTSTRAP
    // ========================================================================

    /// Bring up the local device
    ///
    /// Device keys are generated on first use and loaded from `key_store`
    /// afterwards. The device id is taken from the first fingerprint of the
    /// device and survives restarts.
    pub async fn bootstrap(
        user_id: &str,
        profile: DeviceProfile,
        config: SigilConfig,
        key_store: SecureKeyStore,
        directory: Arc<dyn KeyDirectory>,
    ) -> Result<Self> {
        config.validate()?;

        if !key_store.has_private_key(user_id)? {
            let keys = DeviceKeys::generate(&KeyPairService::new(), &profile.capabilities)?;
            key_store.store_private_key(user_id, &keys)?;
            tracing::info!(user = user_id, "Generated device keys");
        }

        let (signing_public_key, public_keys, key_capabilities) =
            key_store.with_private_key(user_id, |keys| {
                Ok((
                    keys.signing().public_bytes(),
                    keys.public_bundle().clone(),
                    keys.capabilities(),
                ))
            })?;
        let capabilities = key_capabilities.intersection(&profile.capabilities);
        if capabilities.is_empty() {
            return Err(Error::InvalidConfig(
                "Stored device keys support none of the requested algorithms".into(),
            ));
        }

        let fingerprint = compute_device_fingerprint(
            user_id,
            profile.kind.as_str(),
            &signing_public_key,
            profile.hardware_attributes.as_deref(),
        );
        // Ids outlive key rotations: a known fingerprint keeps its id
        let device_id = key_store
            .load_fingerprints(user_id)?
            .remove(&fingerprint)
            .unwrap_or_else(|| fingerprint[..DEVICE_ID_LENGTH].to_string());

        let registration = DeviceRegistration {
            device_id: Some(device_id.clone()),
            user_id: user_id.to_string(),
            name: profile.name,
            kind: profile.kind,
            signing_public_key,
            public_keys,
            capabilities: capabilities.clone(),
            hardware_attributes: profile.hardware_attributes,
        };

        let registry = Arc::new(DeviceRegistry::with_key_store(user_id, key_store.clone())?);
        registry.register(registration.clone())?;
        let published = &registration;
        let dir = &directory;
        retry_with_backoff(&config.recovery, move || dir.register_device(published)).await?;

        let events = SecurityEventLog::new();
        let cache = Arc::new(KeyCache::from_config(&config.cache));
        let keys = Arc::new(ConversationKeyManager::new(
            user_id,
            device_id.as_str(),
            key_store.clone(),
            registry.clone(),
            directory.clone(),
            cache.clone(),
            events.clone(),
            &config,
        ));
        keys.load_stored()?;
        let ratchet = Arc::new(RatchetEngine::new(
            device_id.as_str(),
            config.ratchet.clone(),
            events.clone(),
        ));
        let optimizer = Arc::new(PerformanceOptimizer::new(cache, config.cache.clone()));
        let codec = EncryptionCodec::new(
            user_id,
            device_id.as_str(),
            capabilities,
            key_store.clone(),
            keys.clone(),
            ratchet.clone(),
            registry.clone(),
            optimizer.clone(),
            config.codec.clone(),
        );
        let recovery = ErrorRecoveryCoordinator::new(config.recovery.clone(), events.clone());

        tracing::info!(
            user = user_id,
            device = %device_id,
            fingerprint = &fingerprint[..8],
            "Session ready"
        );
        Ok(Self {
            user_id: user_id.to_string(),
            device_id,
            config,
            key_store,
            directory,
            registry,
            keys,
            ratchet,
            codec,
            optimizer,
            recovery,
            events,
            known_users: Mutex::new(BTreeSet::new()),
            autotune: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Fingerprint of the local device, for out-of-band verification
    pub fn fingerprint(&self) -> Result<String> {
        Ok(self.registry.require(&self.device_id)?.fingerprint)
    }

    pub fn events(&self) -> &SecurityEventLog {
        &self.events
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &EncryptionCodec {
        &self.codec
    }

    pub fn key_manager(&self) -> &ConversationKeyManager {
        &self.keys
    }

    pub fn recovery(&self) -> &ErrorRecoveryCoordinator {
        &self.recovery
    }

    // ========================================================================
    // DEVICES
    // ========================================================================

    /// Pull a user's devices from the directory into the local registry
    ///
    /// New devices are registered, directory revocations and key rotations
    /// are applied. Returns the devices that changed.
    pub async fn sync_devices(&self, user_id: &str) -> Result<Vec<Device>> {
        let directory = &self.directory;
        let listed = retry_with_backoff(&self.config.recovery, move || {
            directory.list_devices(user_id)
        })
        .await?;
        if user_id != self.user_id {
            self.known_users.lock().insert(user_id.to_string());
        }

        let mut changed = Vec::new();
        for entry in listed {
            let registration = entry.registration;
            let Some(device_id) = registration.device_id.clone() else {
                continue;
            };
            if device_id == self.device_id {
                continue;
            }

            match (self.registry.get(&device_id), entry.revoked) {
                (Some(known), Some(reason)) => {
                    if !known.is_revoked() {
                        changed.push(self.registry.revoke(&device_id, &reason)?);
                        self.ratchet.terminate_device(&device_id);
                        self.evict_keys_shared_with(&device_id);
                        self.events.record(
                            None,
                            Some(&device_id),
                            SecurityEventKind::DeviceRevoked { reason },
                        );
                    }
                }
                (None, Some(_)) => self.evict_keys_shared_with(&device_id),
                (Some(known), None) => {
                    if known.signing_public_key != registration.signing_public_key {
                        changed.push(self.registry.rotate_device_keys(
                            &device_id,
                            registration.signing_public_key,
                            registration.public_keys,
                            registration.capabilities,
                        )?);
                    }
                }
                (None, None) => {
                    changed.push(self.registry.register(registration)?.into_device());
                }
            }
        }

        tracing::debug!(user = user_id, changed = changed.len(), "Synced devices");
        Ok(changed)
    }

    /// Drop cached keys of conversations a revoked device still holds
    ///
    /// The revoker publishes a newer version; the next fetch picks it up.
    fn evict_keys_shared_with(&self, device_id: &str) {
        for conversation_id in self.keys.conversations_with_device(device_id) {
            self.optimizer.cache().invalidate_conversation(&conversation_id);
        }
    }

    /// Trust a device, normally after comparing fingerprints
    pub async fn trust_device(&self, device_id: &str, verification: Option<&Verification>) -> Result<Device> {
        let device = self.registry.trust(device_id, verification)?;
        if device.user_id == self.user_id {
            let directory = &self.directory;
            retry_with_backoff(&self.config.recovery, move || directory.trust_device(device_id)).await?;
        }
        Ok(device)
    }

    /// Revoke a device and re-key every conversation it took part in
    ///
    /// Returns the new key of each rotated conversation.
    pub async fn revoke_device(&self, device_id: &str, reason: &str) -> Result<Vec<ConversationKey>> {
        if device_id == self.device_id {
            return Err(Error::InvalidMessage("A device cannot revoke itself".into()));
        }
        if self.registry.get(device_id).is_none() {
            self.sync_devices(&self.user_id).await?;
        }

        self.registry.revoke(device_id, reason)?;
        let directory = &self.directory;
        retry_with_backoff(&self.config.recovery, move || {
            directory.revoke_device(device_id, reason)
        })
        .await?;

        self.events.record(
            None,
            Some(device_id),
            SecurityEventKind::DeviceRevoked {
                reason: reason.to_string(),
            },
        );
        self.ratchet.terminate_device(device_id);

        let mut rotated = Vec::new();
        for conversation_id in self.keys.conversations_with_device(device_id) {
            rotated.push(self.rotate(&conversation_id, RotationReason::DeviceRevoked).await?);
        }
        tracing::warn!(
            device = device_id,
            conversations = rotated.len(),
            "Device revoked and conversations re-keyed"
        );
        Ok(rotated)
    }

    /// Replace the local device keys
    ///
    /// Stored conversation keys stay readable. Peers pick up the new keys on
    /// their next device sync.
    pub async fn rotate_local_device_keys(&self) -> Result<Device> {
        let local = self.registry.require(&self.device_id)?;
        let keys = DeviceKeys::generate(&KeyPairService::new(), &local.capabilities)?;

        self.registry.rotate_device_keys(
            &self.device_id,
            keys.signing().public_bytes(),
            keys.public_bundle().clone(),
            local.capabilities.clone(),
        )?;
        // New keys were generated here, nothing to verify
        let device = self.registry.trust(&self.device_id, None)?;
        self.key_store.store_private_key(&self.user_id, &keys)?;

        let registration = DeviceRegistration::from_device(&device);
        let published = &registration;
        let directory = &self.directory;
        retry_with_backoff(&self.config.recovery, move || {
            directory.rotate_device_keys(published)
        })
        .await?;

        tracing::info!(device = %self.device_id, "Rotated local device keys");
        Ok(device)
    }

    // ========================================================================
    // CONVERSATIONS
    // ========================================================================

    /// Create the first key of a conversation shared with `participant_devices`
    pub async fn setup_conversation(
        &self,
        conversation_id: &str,
        participant_devices: &[String],
        consent: Option<&DowngradeConsent>,
    ) -> Result<ConversationKey> {
        let key = self
            .keys
            .setup_conversation(conversation_id, participant_devices, consent)
            .await?;
        self.ratchet
            .initialize(conversation_id, key.version(), key.secret.key())?;
        Ok(key)
    }

    /// Move a conversation to a new key version
    pub async fn rotate(&self, conversation_id: &str, reason: RotationReason) -> Result<ConversationKey> {
        let key = self.keys.rotate(conversation_id, reason).await?;
        self.ratchet
            .initialize(conversation_id, key.version(), key.secret.key())?;
        self.recovery.rotation_completed(conversation_id);
        Ok(key)
    }

    /// Rotate every conversation whose policy interval elapsed
    pub async fn rotate_due(&self, now_millis: i64) -> Result<Vec<ConversationKey>> {
        let rotated = self.keys.rotate_due(now_millis).await?;
        for key in &rotated {
            let conversation_id = &key.secret.conversation_id;
            self.ratchet
                .initialize(conversation_id, key.version(), key.secret.key())?;
            self.recovery.rotation_completed(conversation_id);
        }
        Ok(rotated)
    }

    /// Media key for a call in this conversation
    pub async fn media_key(&self, conversation_id: &str, call_id: &str) -> Result<MediaKey> {
        self.keys.media_key(conversation_id, call_id).await
    }

    /// Abandon pending work and forget in-memory state of a conversation
    pub fn teardown_conversation(&self, conversation_id: &str) {
        self.keys.teardown(conversation_id);
        self.ratchet.teardown(conversation_id);
    }

    // ========================================================================
    // ENCRYPT / DECRYPT
    // ========================================================================

    pub async fn encrypt(&self, conversation_id: &str, plaintext: &[u8]) -> Result<Envelope> {
        self.recovery.ensure_send_allowed(conversation_id)?;
        let codec = &self.codec;
        self.with_recovery(ErrorContext::encrypt(conversation_id), None, move || {
            codec.encrypt(plaintext, conversation_id)
        })
        .await
    }

    /// Encrypt, splitting large payloads into linked chunks
    pub async fn encrypt_message(&self, conversation_id: &str, plaintext: &[u8]) -> Result<Vec<Envelope>> {
        self.recovery.ensure_send_allowed(conversation_id)?;
        let codec = &self.codec;
        self.with_recovery(ErrorContext::encrypt(conversation_id), None, move || {
            codec.encrypt_message(plaintext, conversation_id)
        })
        .await
    }

    pub async fn decrypt(&self, conversation_id: &str, envelope: &Envelope) -> Result<Vec<u8>> {
        let ctx = ErrorContext::decrypt(conversation_id, envelope.message_id());
        let codec = &self.codec;
        self.with_recovery(ctx, Some(envelope), move || codec.decrypt(envelope, conversation_id))
            .await
    }

    /// Decrypt a message delivered as one or more chunk envelopes
    pub async fn decrypt_message(&self, conversation_id: &str, envelopes: &[Envelope]) -> Result<Vec<u8>> {
        let first = envelopes.first();
        let ctx = ErrorContext::decrypt(conversation_id, first.and_then(|e| e.message_id()));
        let codec = &self.codec;
        self.with_recovery(ctx, first, move || {
            codec.decrypt_message(envelopes, conversation_id)
        })
        .await
    }

    /// Run `op`, handing failures to the recovery coordinator
    ///
    /// The loop ends when `op` succeeds, recovery gives up, or recovery has
    /// run `max_attempts + 1` times.
    async fn with_recovery<T, F, Fut>(
        &self,
        mut ctx: ErrorContext,
        envelope: Option<&Envelope>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conversation_id = ctx.conversation_id.clone().unwrap_or_default();
        loop {
            let error = match op().await {
                Ok(value) => {
                    self.recovery.record_success(&conversation_id);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if ctx.operation == Operation::Decrypt {
                self.note_decrypt_failure(&conversation_id, envelope, &error);
            }
            if ctx.attempt > self.config.recovery.max_attempts {
                self.recovery.mark_unrecoverable(&error, &ctx);
                return Err(error);
            }

            let strategy = self.recovery.recover(&error, &ctx, self).await?;
            tracing::debug!(
                conversation = %conversation_id,
                attempt = ctx.attempt,
                strategy = ?strategy,
                "Retrying after recovery"
            );
            ctx.attempt += 1;
        }
    }

    fn note_decrypt_failure(&self, conversation_id: &str, envelope: Option<&Envelope>, error: &Error) {
        let inner = envelope.and_then(|e| e.inner());
        self.events.record(
            Some(conversation_id),
            inner.map(|e| e.sender_device_id.as_str()),
            SecurityEventKind::DecryptionFailed {
                error: error.kind(),
                key_version: inner.map(|e| e.key_version),
            },
        );
        // An unknown sender is looked up under its user on the next sync
        if let (Error::DeviceNotFound(_), Some(inner)) = (error, inner) {
            if inner.sender_user_id != self.user_id {
                self.known_users.lock().insert(inner.sender_user_id.clone());
            }
        }
    }

    // ========================================================================
    // BACKUP
    // ========================================================================

    pub fn create_backup(&self, password: &str) -> Result<Vec<u8>> {
        self.key_store.create_backup(&self.user_id, password)
    }

    /// Restore keys from a backup blob; cached keys are dropped
    pub fn restore_backup(&self, blob: &[u8], password: &str) -> Result<RestoreSummary> {
        let summary = self.key_store.restore_from_backup(blob, password)?;
        self.optimizer.cache().clear();
        tracing::info!(
            conversations = summary.conversations.len(),
            "Restored keys from backup"
        );
        Ok(summary)
    }

    // ========================================================================
    // PERFORMANCE
    // ========================================================================

    pub fn configure_cache(&self, tuning: CacheTuning) -> Result<()> {
        self.optimizer.cache().configure(tuning)
    }

    pub fn cache_tuning(&self) -> CacheTuning {
        self.optimizer.cache().tuning()
    }

    /// Start adaptive cache tuning; a running tuner is left alone
    pub fn start_autotune(&self) {
        let mut autotune = self.autotune.lock();
        if autotune.as_ref().map_or(false, |h| h.is_running()) {
            return;
        }
        *autotune = Some(
            self.optimizer
                .spawn_autotune(self.config.cache.autotune_interval),
        );
    }

    pub async fn stop_autotune(&self) {
        let handle = self.autotune.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    async fn sync_known_users(&self) -> Result<()> {
        let mut users: Vec<String> = self.known_users.lock().iter().cloned().collect();
        users.push(self.user_id.clone());
        try_join_all(users.iter().map(|user| self.sync_devices(user))).await?;
        Ok(())
    }
}

#[async_trait]
impl RecoveryActions for SigilSession {
    async fn renegotiate(&self, conversation_id: &str) -> Result<()> {
        self.sync_known_users().await?;
        self.optimizer.cache().invalidate_conversation(conversation_id);
        let secret = self.keys.fetch_or_unwrap(conversation_id).await?;
        self.ratchet
            .initialize(conversation_id, secret.version, secret.key())
    }

    async fn reregister_device(&self) -> Result<()> {
        let local = self.registry.require(&self.device_id)?;
        let registration = DeviceRegistration::from_device(&local);
        let published = &registration;
        let directory = &self.directory;
        retry_with_backoff(&self.config.recovery, move || {
            directory.register_device(published)
        })
        .await?;
        self.sync_known_users().await
    }

    async fn force_rotation(&self, conversation_id: &str) -> Result<()> {
        self.rotate(conversation_id, RotationReason::Recovery).await?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
