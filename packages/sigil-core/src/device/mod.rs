//! # Device Registry
//!
//! The local view of every device taking part in this user's conversations:
//! its keys, its declared capabilities and how far it is trusted.
//!
//! ## Trust Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        DEVICE TRUST STATES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   register()                                                           │
//! │      │                                                                  │
//! │      ├── first device of the local user ──────────────► Trusted        │
//! │      ├── later device of the local user ──► PendingVerification        │
//! │      └── device of another user ──────────► Untrusted                  │
//! │                                                                         │
//! │   Untrusted / PendingVerification ──trust(verification)──► Trusted     │
//! │                                                                         │
//! │   any active state ──suspend()──► Suspended ──unsuspend()──► previous  │
//! │                                                                         │
//! │   any state ──revoke()──► Revoked (terminal, record kept for audit)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only `Trusted` devices receive wrapped conversation keys. Suspended and
//! revoked devices take no part in negotiation.
//!
//! ## Fingerprints
//!
//! ```text
//! fingerprint = SHA-256(domain || user_id || kind || signing_key [|| hardware])
//! ```
//!
//! Re-registering a known fingerprint returns the existing record. A
//! fingerprint that maps to a different identity is a `FingerprintConflict`
//! and is never merged.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::kdf::{compute_device_fingerprint, format_fingerprint};
use crate::crypto::{CapabilitySet, PublicKeyBundle};
use crate::encoding::hex_array;
use crate::error::{Error, Result};
use crate::storage::SecureKeyStore;

/// Form factor of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
    Web,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "desktop",
            DeviceKind::Mobile => "mobile",
            DeviceKind::Tablet => "tablet",
            DeviceKind::Web => "web",
            DeviceKind::Other => "other",
        }
    }
}

/// How far a device is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Untrusted,
    PendingVerification,
    Trusted,
    Suspended,
    Revoked,
}

impl TrustState {
    /// Takes part in negotiation
    pub fn is_active(&self) -> bool {
        !matches!(self, TrustState::Suspended | TrustState::Revoked)
    }

    /// May receive wrapped conversation keys
    pub fn receives_keys(&self) -> bool {
        matches!(self, TrustState::Trusted)
    }
}

/// Audit record of a revocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub reason: String,
    /// Unix milliseconds
    pub revoked_at: i64,
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: DeviceKind,
    /// Ed25519 key that signs this device's envelopes
    #[serde(with = "hex_array")]
    pub signing_public_key: [u8; 32],
    /// KEM keys that receive wrapped conversation keys
    pub public_keys: PublicKeyBundle,
    pub capabilities: CapabilitySet,
    pub trust: TrustState,
    /// 64 hex characters
    pub fingerprint: String,
    pub hardware_attributes: Option<String>,
    pub registered_at: i64,
    pub last_seen: i64,
    /// State to return to when unsuspended
    pub suspended_from: Option<TrustState>,
    pub revocation: Option<Revocation>,
}

impl Device {
    pub fn is_revoked(&self) -> bool {
        self.trust == TrustState::Revoked
    }

    /// Fingerprint grouped for display
    pub fn display_fingerprint(&self) -> String {
        format_fingerprint(&self.fingerprint)
    }

    fn ensure_not_revoked(&self) -> Result<()> {
        if self.is_revoked() {
            Err(Error::DeviceRevoked(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

/// Announcement of a device, as carried by `POST /devices`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Stable id chosen by the device; generated when absent
    pub device_id: Option<String>,
    pub user_id: String,
    pub name: String,
    pub kind: DeviceKind,
    #[serde(with = "hex_array")]
    pub signing_public_key: [u8; 32],
    pub public_keys: PublicKeyBundle,
    pub capabilities: CapabilitySet,
    pub hardware_attributes: Option<String>,
}

impl DeviceRegistration {
    /// The registration a known device record corresponds to
    pub fn from_device(device: &Device) -> Self {
        Self {
            device_id: Some(device.id.clone()),
            user_id: device.user_id.clone(),
            name: device.name.clone(),
            kind: device.kind,
            signing_public_key: device.signing_public_key,
            public_keys: device.public_keys.clone(),
            capabilities: device.capabilities.clone(),
            hardware_attributes: device.hardware_attributes.clone(),
        }
    }

    fn fingerprint(&self) -> String {
        compute_device_fingerprint(
            &self.user_id,
            self.kind.as_str(),
            &self.signing_public_key,
            self.hardware_attributes.as_deref(),
        )
    }
}

/// Outcome of [`DeviceRegistry::register`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Created(Device),
    AlreadyRegistered(Device),
}

impl Registration {
    pub fn device(&self) -> &Device {
        match self {
            Registration::Created(d) | Registration::AlreadyRegistered(d) => d,
        }
    }

    pub fn into_device(self) -> Device {
        match self {
            Registration::Created(d) | Registration::AlreadyRegistered(d) => d,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Created(_))
    }
}

/// Out-of-band proof used to trust a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Fingerprint as compared by the user, spaces and case ignored
    pub fingerprint: String,
}

impl Verification {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
        }
    }

    fn normalized(&self) -> String {
        self.fingerprint
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase()
    }
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, Device>,
    /// fingerprint → device id
    fingerprints: HashMap<String, String>,
}

/// Registry of known devices for one local user
pub struct DeviceRegistry {
    local_user_id: String,
    state: RwLock<RegistryState>,
    key_store: Option<SecureKeyStore>,
}

impl DeviceRegistry {
    /// Registry without fingerprint persistence
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            state: RwLock::new(RegistryState::default()),
            key_store: None,
        }
    }

    /// Registry whose fingerprint cache is persisted in `key_store`
    ///
    /// Known fingerprints are reloaded, so a device registering again after
    /// a restart keeps its id.
    pub fn with_key_store(local_user_id: impl Into<String>, key_store: SecureKeyStore) -> Result<Self> {
        let local_user_id = local_user_id.into();
        let fingerprints = key_store.load_fingerprints(&local_user_id)?;
        tracing::debug!(
            user = %local_user_id,
            fingerprints = fingerprints.len(),
            "Loaded fingerprint cache"
        );
        Ok(Self {
            local_user_id,
            state: RwLock::new(RegistryState {
                devices: HashMap::new(),
                fingerprints,
            }),
            key_store: Some(key_store),
        })
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    fn persist_fingerprints(&self, state: &RegistryState) -> Result<()> {
        if let Some(store) = &self.key_store {
            store.store_fingerprints(&self.local_user_id, &state.fingerprints)?;
        }
        Ok(())
    }

    /// Register a device, idempotently
    ///
    /// ## Errors
    ///
    /// - `FingerprintConflict` if the fingerprint or id is already bound to a
    ///   different identity
    /// - `DeviceRevoked` if the fingerprint belongs to a revoked device
    /// - `InvalidKey` if a declared capability has no matching public key
    pub fn register(&self, registration: DeviceRegistration) -> Result<Registration> {
        for algorithm in registration.capabilities.iter() {
            if !registration.public_keys.supports(algorithm.kem()) {
                return Err(Error::InvalidKey(format!(
                    "Device declares {} without a matching public key",
                    algorithm
                )));
            }
        }

        let fingerprint = registration.fingerprint();
        let now = crate::time::now_timestamp_millis();
        let mut state = self.state.write();

        let known_id = state.fingerprints.get(&fingerprint).cloned();
        if let Some(existing) = known_id.as_ref().and_then(|id| state.devices.get(id)) {
            if existing.signing_public_key != registration.signing_public_key
                || existing.user_id != registration.user_id
            {
                return Err(Error::FingerprintConflict(format!(
                    "Fingerprint {}… is bound to device {}",
                    &fingerprint[..8],
                    existing.id
                )));
            }
            if let Some(requested) = &registration.device_id {
                if requested != &existing.id {
                    return Err(Error::FingerprintConflict(format!(
                        "Fingerprint {}… is bound to device {}, not {}",
                        &fingerprint[..8],
                        existing.id,
                        requested
                    )));
                }
            }
            existing.ensure_not_revoked()?;
            tracing::debug!(device = %existing.id, "Device already registered");
            return Ok(Registration::AlreadyRegistered(existing.clone()));
        }

        let id = match (&registration.device_id, known_id) {
            (Some(requested), Some(cached)) if requested != &cached => {
                return Err(Error::FingerprintConflict(format!(
                    "Fingerprint {}… was cached for device {}",
                    &fingerprint[..8],
                    cached
                )));
            }
            (Some(requested), _) => requested.clone(),
            (None, Some(cached)) => cached,
            (None, None) => Uuid::new_v4().to_string(),
        };

        if let Some(existing) = state.devices.get(&id) {
            // Same id, different identity
            return Err(Error::FingerprintConflict(format!(
                "Device id {} is registered with fingerprint {}…",
                id,
                &existing.fingerprint[..8]
            )));
        }

        let trust = if registration.user_id != self.local_user_id {
            TrustState::Untrusted
        } else if state
            .devices
            .values()
            .any(|d| d.user_id == self.local_user_id && !d.is_revoked())
        {
            TrustState::PendingVerification
        } else {
            TrustState::Trusted
        };

        let device = Device {
            id: id.clone(),
            user_id: registration.user_id,
            name: registration.name,
            kind: registration.kind,
            signing_public_key: registration.signing_public_key,
            public_keys: registration.public_keys,
            capabilities: registration.capabilities,
            trust,
            fingerprint: fingerprint.clone(),
            hardware_attributes: registration.hardware_attributes,
            registered_at: now,
            last_seen: now,
            suspended_from: None,
            revocation: None,
        };

        state.fingerprints.insert(fingerprint.clone(), id.clone());
        state.devices.insert(id.clone(), device.clone());
        self.persist_fingerprints(&state)?;

        tracing::info!(
            device = %id,
            user = %device.user_id,
            trust = ?trust,
            fingerprint = &fingerprint[..8],
            "Registered device"
        );
        Ok(Registration::Created(device))
    }

    fn update<F>(&self, device_id: &str, f: F) -> Result<Device>
    where
        F: FnOnce(&mut Device) -> Result<()>,
    {
        let mut state = self.state.write();
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        f(device)?;
        Ok(device.clone())
    }

    /// Mark a device as trusted
    ///
    /// A verification whose fingerprint does not match is a
    /// `FingerprintConflict`.
    pub fn trust(&self, device_id: &str, verification: Option<&Verification>) -> Result<Device> {
        let device = self.update(device_id, |device| {
            device.ensure_not_revoked()?;
            if let Some(verification) = verification {
                if verification.normalized() != device.fingerprint {
                    return Err(Error::FingerprintConflict(format!(
                        "Verification does not match device {}",
                        device.id
                    )));
                }
            }
            device.trust = TrustState::Trusted;
            device.suspended_from = None;
            Ok(())
        })?;
        tracing::info!(device = device_id, verified = verification.is_some(), "Trusted device");
        Ok(device)
    }

    /// Soft-revoke a device; the record is kept for audit
    pub fn revoke(&self, device_id: &str, reason: &str) -> Result<Device> {
        let device = self.update(device_id, |device| {
            device.ensure_not_revoked()?;
            device.trust = TrustState::Revoked;
            device.suspended_from = None;
            device.revocation = Some(Revocation {
                reason: reason.to_string(),
                revoked_at: crate::time::now_timestamp_millis(),
            });
            Ok(())
        })?;
        tracing::warn!(device = device_id, reason, "Revoked device");
        Ok(device)
    }

    /// Take a device out of negotiation without touching its keys
    pub fn suspend(&self, device_id: &str) -> Result<Device> {
        let device = self.update(device_id, |device| {
            device.ensure_not_revoked()?;
            if device.trust != TrustState::Suspended {
                device.suspended_from = Some(device.trust);
                device.trust = TrustState::Suspended;
            }
            Ok(())
        })?;
        tracing::info!(device = device_id, "Suspended device");
        Ok(device)
    }

    /// Restore the state a device had before it was suspended
    pub fn unsuspend(&self, device_id: &str) -> Result<Device> {
        let device = self.update(device_id, |device| {
            device.ensure_not_revoked()?;
            if device.trust == TrustState::Suspended {
                device.trust = device
                    .suspended_from
                    .take()
                    .unwrap_or(TrustState::PendingVerification);
            }
            Ok(())
        })?;
        tracing::info!(device = device_id, trust = ?device.trust, "Unsuspended device");
        Ok(device)
    }

    /// Record activity from a device
    pub fn touch(&self, device_id: &str) -> Result<Device> {
        self.update(device_id, |device| {
            device.ensure_not_revoked()?;
            device.last_seen = crate::time::now_timestamp_millis();
            Ok(())
        })
    }

    /// Replace a device's keys
    ///
    /// The fingerprint changes with the signing key, so the device must be
    /// verified again: trust resets to `PendingVerification`.
    pub fn rotate_device_keys(
        &self,
        device_id: &str,
        signing_public_key: [u8; 32],
        public_keys: PublicKeyBundle,
        capabilities: CapabilitySet,
    ) -> Result<Device> {
        for algorithm in capabilities.iter() {
            if !public_keys.supports(algorithm.kem()) {
                return Err(Error::InvalidKey(format!(
                    "Device declares {} without a matching public key",
                    algorithm
                )));
            }
        }

        let mut state = self.state.write();
        let device = state
            .devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        device.ensure_not_revoked()?;

        let fingerprint = compute_device_fingerprint(
            &device.user_id,
            device.kind.as_str(),
            &signing_public_key,
            device.hardware_attributes.as_deref(),
        );
        if let Some(other) = state.fingerprints.get(&fingerprint) {
            if other != device_id {
                return Err(Error::FingerprintConflict(format!(
                    "New keys collide with device {}",
                    other
                )));
            }
        }

        let old_fingerprint = device.fingerprint.clone();
        state.fingerprints.remove(&old_fingerprint);
        state.fingerprints.insert(fingerprint.clone(), device_id.to_string());

        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        device.signing_public_key = signing_public_key;
        device.public_keys = public_keys;
        device.capabilities = capabilities;
        device.fingerprint = fingerprint;
        device.trust = TrustState::PendingVerification;
        device.suspended_from = None;
        device.last_seen = crate::time::now_timestamp_millis();
        let device = device.clone();

        self.persist_fingerprints(&state)?;
        tracing::info!(device = device_id, "Rotated device keys");
        Ok(device)
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.state.read().devices.get(device_id).cloned()
    }

    /// Like [`get`](Self::get) but fails with `DeviceNotFound`
    pub fn require(&self, device_id: &str) -> Result<Device> {
        self.get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }

    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<Device> {
        let state = self.state.read();
        state
            .fingerprints
            .get(fingerprint)
            .and_then(|id| state.devices.get(id))
            .cloned()
    }

    /// Every device of a user, including revoked ones, ordered by id
    pub fn devices_for_user(&self, user_id: &str) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .state
            .read()
            .devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Every known device, ordered by id
    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.state.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::crypto::{Algorithm, DeviceKeys, KeyPairService};

    fn registration(user: &str, name: &str) -> (DeviceRegistration, DeviceKeys) {
        let caps = CapabilitySet::new([Algorithm::X25519Aes256Gcm]);
        let keys = DeviceKeys::generate(&KeyPairService::new(), &caps).unwrap();
        let reg = DeviceRegistration {
            device_id: None,
            user_id: user.into(),
            name: name.into(),
            kind: DeviceKind::Desktop,
            signing_public_key: keys.signing().public_bytes(),
            public_keys: keys.public_bundle().clone(),
            capabilities: caps,
            hardware_attributes: None,
        };
        (reg, keys)
    }

    #[test]
    fn test_initial_trust_states() {
        let registry = DeviceRegistry::new("alice");

        let first = registry.register(registration("alice", "laptop").0).unwrap();
        assert!(first.is_new());
        assert_eq!(first.device().trust, TrustState::Trusted);

        let second = registry.register(registration("alice", "phone").0).unwrap();
        assert_eq!(second.device().trust, TrustState::PendingVerification);

        let peer = registry.register(registration("bob", "desktop").0).unwrap();
        assert_eq!(peer.device().trust, TrustState::Untrusted);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = DeviceRegistry::new("alice");
        let (reg, _) = registration("alice", "laptop");

        let first = registry.register(reg.clone()).unwrap().into_device();
        let again = registry.register(reg).unwrap();

        assert!(!again.is_new());
        assert_eq!(again.device().id, first.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let (reg, _) = registration("alice", "laptop");
        assert_eq!(reg.fingerprint(), reg.clone().fingerprint());

        let mut with_hw = reg.clone();
        with_hw.hardware_attributes = Some("tpm:1234".into());
        assert_ne!(reg.fingerprint(), with_hw.fingerprint());
    }

    #[test]
    fn test_conflicting_id_is_rejected() {
        let registry = DeviceRegistry::new("alice");
        let (mut a, _) = registration("alice", "laptop");
        a.device_id = Some("dev-1".into());
        registry.register(a).unwrap();

        let (mut b, _) = registration("alice", "impostor");
        b.device_id = Some("dev-1".into());
        let err = registry.register(b).unwrap_err();
        assert!(matches!(err, Error::FingerprintConflict(_)));
    }

    #[test]
    fn test_known_fingerprint_with_other_id_conflicts() {
        let registry = DeviceRegistry::new("alice");
        let (mut reg, _) = registration("alice", "laptop");
        reg.device_id = Some("dev-1".into());
        registry.register(reg.clone()).unwrap();

        reg.device_id = Some("dev-2".into());
        let err = registry.register(reg).unwrap_err();
        assert!(matches!(err, Error::FingerprintConflict(_)));
    }

    #[test]
    fn test_trust_with_verification() {
        let registry = DeviceRegistry::new("alice");
        let device = registry.register(registration("bob", "phone").0).unwrap().into_device();

        let wrong = Verification::new("0000");
        let err = registry.trust(&device.id, Some(&wrong)).unwrap_err();
        assert!(matches!(err, Error::FingerprintConflict(_)));

        // Display grouping is accepted
        let right = Verification::new(device.display_fingerprint());
        let trusted = registry.trust(&device.id, Some(&right)).unwrap();
        assert_eq!(trusted.trust, TrustState::Trusted);
    }

    #[test]
    fn test_suspend_restores_previous_state() {
        let registry = DeviceRegistry::new("alice");
        registry.register(registration("alice", "laptop").0).unwrap();
        let phone = registry.register(registration("alice", "phone").0).unwrap().into_device();

        let suspended = registry.suspend(&phone.id).unwrap();
        assert_eq!(suspended.trust, TrustState::Suspended);
        assert!(!suspended.trust.is_active());

        let restored = registry.unsuspend(&phone.id).unwrap();
        assert_eq!(restored.trust, TrustState::PendingVerification);
    }

    #[test]
    fn test_revoke_is_terminal() {
        let registry = DeviceRegistry::new("alice");
        let (reg, _) = registration("alice", "laptop");
        let device = registry.register(reg.clone()).unwrap().into_device();

        let revoked = registry.revoke(&device.id, "stolen").unwrap();
        assert_eq!(revoked.trust, TrustState::Revoked);
        assert_eq!(revoked.revocation.as_ref().unwrap().reason, "stolen");

        assert!(matches!(registry.trust(&device.id, None).unwrap_err(), Error::DeviceRevoked(_)));
        assert!(matches!(registry.touch(&device.id).unwrap_err(), Error::DeviceRevoked(_)));
        assert!(matches!(registry.revoke(&device.id, "again").unwrap_err(), Error::DeviceRevoked(_)));
        assert!(matches!(registry.register(reg).unwrap_err(), Error::DeviceRevoked(_)));

        // Kept for audit
        assert!(registry.get(&device.id).is_some());
    }

    #[test]
    fn test_rotate_device_keys_resets_trust() {
        let registry = DeviceRegistry::new("alice");
        let device = registry.register(registration("alice", "laptop").0).unwrap().into_device();
        assert_eq!(device.trust, TrustState::Trusted);

        let (fresh, _) = registration("alice", "laptop");
        let rotated = registry
            .rotate_device_keys(
                &device.id,
                fresh.signing_public_key,
                fresh.public_keys,
                fresh.capabilities,
            )
            .unwrap();

        assert_eq!(rotated.trust, TrustState::PendingVerification);
        assert_ne!(rotated.fingerprint, device.fingerprint);
        assert!(registry.find_by_fingerprint(&device.fingerprint).is_none());
        assert_eq!(registry.find_by_fingerprint(&rotated.fingerprint).unwrap().id, device.id);
    }

    #[test]
    fn test_capability_without_key_is_rejected() {
        let registry = DeviceRegistry::new("alice");
        let (mut reg, _) = registration("alice", "laptop");
        reg.capabilities.insert(Algorithm::Kyber768Aes256Gcm);
        assert!(matches!(registry.register(reg).unwrap_err(), Error::InvalidKey(_)));
    }

    #[test]
    fn test_fingerprint_cache_survives_restart() {
        let store = SecureKeyStore::in_memory(BackupConfig::default());
        let (reg, _) = registration("alice", "laptop");

        let id = {
            let registry = DeviceRegistry::with_key_store("alice", store.clone()).unwrap();
            registry.register(reg.clone()).unwrap().into_device().id
        };

        let registry = DeviceRegistry::with_key_store("alice", store).unwrap();
        let again = registry.register(reg).unwrap();
        assert_eq!(again.device().id, id);
    }
}
