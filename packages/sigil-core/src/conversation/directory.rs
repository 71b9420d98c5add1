//! Key directory: the remote side of device and conversation key exchange.
//!
//! ```text
//! POST   /devices                               register_device
//! POST   /devices/{id}/trust                    trust_device
//! DELETE /devices/{id}                          revoke_device
//! POST   /devices/{id}/rotate-keys              rotate_device_keys
//! GET    /conversations/{id}/encryption-key     fetch_key
//! POST   /conversations/{id}/setup-encryption   setup_encryption
//! POST   /conversations/{id}/rotate-key         rotate_key
//! ```
//!
//! Transport framing belongs to the host. [`MemoryDirectory`] keeps
//! everything in process and can inject latency and network failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::RotationReason;
use crate::crypto::{Algorithm, Signed, WrappedKey};
use crate::device::DeviceRegistration;
use crate::encoding::hex_array;
use crate::error::{Error, Result};
use crate::negotiation::Negotiation;

/// One wrapped copy of a conversation key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyCopy {
    pub device_id: String,
    /// Signing key of the recipient device at wrap time
    #[serde(with = "hex_array")]
    pub device_public_key: [u8; 32],
    pub wrapped: WrappedKey,
}

/// Body of `setup-encryption` and `rotate-key`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDistribution {
    pub conversation_id: String,
    pub version: u32,
    pub algorithm: Algorithm,
    pub copies: Vec<WrappedKeyCopy>,
    /// `None` for the initial setup
    pub reason: Option<RotationReason>,
    pub negotiation: Signed<Negotiation>,
    /// Device that generated the key
    pub created_by: String,
    /// Unix milliseconds
    pub created_at: i64,
}

/// What `encryption-key` returns to one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteKey {
    pub conversation_id: String,
    pub version: u32,
    pub algorithm: Algorithm,
    pub participants: Vec<String>,
    /// `None` when no copy was wrapped for the asking device
    pub wrapped: Option<WrappedKey>,
}

/// A device as the directory knows it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryDevice {
    pub registration: DeviceRegistration,
    pub trusted: bool,
    /// Revocation reason, if revoked
    pub revoked: Option<String>,
}

/// Remote device and key directory
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish a device; returns its id
    async fn register_device(&self, registration: &DeviceRegistration) -> Result<String>;

    async fn trust_device(&self, device_id: &str) -> Result<()>;

    async fn revoke_device(&self, device_id: &str, reason: &str) -> Result<()>;

    async fn rotate_device_keys(&self, registration: &DeviceRegistration) -> Result<()>;

    /// Every device of a user, revoked ones included
    async fn list_devices(&self, user_id: &str) -> Result<Vec<DirectoryDevice>>;

    /// Wrapped key for `device_id`; the current version unless one is named
    async fn fetch_key(
        &self,
        conversation_id: &str,
        device_id: &str,
        version: Option<u32>,
    ) -> Result<Option<RemoteKey>>;

    /// Publish the first key version of a conversation
    ///
    /// Fails with `KeyMismatchNeedsSetup` if the conversation already has a
    /// key at this version or later.
    async fn setup_encryption(&self, distribution: &KeyDistribution) -> Result<()>;

    /// Publish a newer key version
    ///
    /// Fails with `KeyMismatchNeedsSetup` unless the version is newer than
    /// the directory's current one.
    async fn rotate_key(&self, distribution: &KeyDistribution) -> Result<()>;
}

// ============================================================================
// IN-MEMORY DIRECTORY
// ============================================================================

#[derive(Default)]
struct DirectoryState {
    devices: HashMap<String, DirectoryDevice>,
    /// conversation → every published version, ascending
    keys: HashMap<String, Vec<KeyDistribution>>,
}

/// In-process [`KeyDirectory`] shared by every session in a process
#[derive(Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
    fail_next: AtomicUsize,
    latency_ms: AtomicU64,
    calls: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `NetworkUnavailable`
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls served so far, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Version the directory currently serves for a conversation
    pub fn current_version(&self, conversation_id: &str) -> Option<u32> {
        self.state
            .read()
            .keys
            .get(conversation_id)
            .and_then(|versions| versions.last())
            .map(|d| d.version)
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::NetworkUnavailable("Injected directory failure".into()));
        }
        Ok(())
    }

    fn publish(&self, distribution: &KeyDistribution) -> Result<()> {
        let mut state = self.state.write();
        let versions = state
            .keys
            .entry(distribution.conversation_id.clone())
            .or_default();
        let current = versions.last().map(|d| d.version);
        if current.map_or(false, |v| distribution.version <= v) {
            return Err(Error::KeyMismatchNeedsSetup {
                conversation_id: distribution.conversation_id.clone(),
                local: Some(distribution.version),
                remote: current,
            });
        }
        versions.push(distribution.clone());
        Ok(())
    }

    fn update_device<F>(&self, device_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut DirectoryDevice),
    {
        let mut state = self.state.write();
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        if device.revoked.is_some() {
            return Err(Error::DeviceRevoked(device_id.to_string()));
        }
        f(device);
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn register_device(&self, registration: &DeviceRegistration) -> Result<String> {
        self.enter().await?;
        let id = registration
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut state = self.state.write();
        if let Some(existing) = state.devices.get(&id) {
            if existing.revoked.is_some() {
                return Err(Error::DeviceRevoked(id));
            }
            if existing.registration.signing_public_key != registration.signing_public_key {
                return Err(Error::FingerprintConflict(format!(
                    "Device id {} is registered with a different key",
                    id
                )));
            }
            return Ok(id);
        }

        let mut registration = registration.clone();
        registration.device_id = Some(id.clone());
        state.devices.insert(
            id.clone(),
            DirectoryDevice {
                registration,
                trusted: false,
                revoked: None,
            },
        );
        Ok(id)
    }

    async fn trust_device(&self, device_id: &str) -> Result<()> {
        self.enter().await?;
        self.update_device(device_id, |d| d.trusted = true)
    }

    async fn revoke_device(&self, device_id: &str, reason: &str) -> Result<()> {
        self.enter().await?;
        self.update_device(device_id, |d| {
            d.trusted = false;
            d.revoked = Some(reason.to_string());
        })
    }

    async fn rotate_device_keys(&self, registration: &DeviceRegistration) -> Result<()> {
        self.enter().await?;
        let device_id = registration
            .device_id
            .clone()
            .ok_or_else(|| Error::InvalidMessage("Key rotation without a device id".into()))?;
        self.update_device(&device_id, |d| {
            d.registration = registration.clone();
            d.trusted = false;
        })
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DirectoryDevice>> {
        self.enter().await?;
        let state = self.state.read();
        let mut devices: Vec<DirectoryDevice> = state
            .devices
            .values()
            .filter(|d| d.registration.user_id == user_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.registration.device_id.cmp(&b.registration.device_id));
        Ok(devices)
    }

    async fn fetch_key(
        &self,
        conversation_id: &str,
        device_id: &str,
        version: Option<u32>,
    ) -> Result<Option<RemoteKey>> {
        self.enter().await?;
        let state = self.state.read();
        let Some(versions) = state.keys.get(conversation_id) else {
            return Ok(None);
        };
        let distribution = match version {
            Some(v) => versions.iter().find(|d| d.version == v),
            None => versions.last(),
        };
        Ok(distribution.map(|d| RemoteKey {
            conversation_id: d.conversation_id.clone(),
            version: d.version,
            algorithm: d.algorithm,
            participants: d.negotiation.data.participants.clone(),
            wrapped: d
                .copies
                .iter()
                .find(|c| c.device_id == device_id)
                .map(|c| c.wrapped.clone()),
        }))
    }

    async fn setup_encryption(&self, distribution: &KeyDistribution) -> Result<()> {
        self.enter().await?;
        self.publish(distribution)?;
        tracing::debug!(
            conversation = %distribution.conversation_id,
            version = distribution.version,
            copies = distribution.copies.len(),
            "Directory accepted key setup"
        );
        Ok(())
    }

    async fn rotate_key(&self, distribution: &KeyDistribution) -> Result<()> {
        self.enter().await?;
        self.publish(distribution)?;
        tracing::debug!(
            conversation = %distribution.conversation_id,
            version = distribution.version,
            reason = ?distribution.reason,
            "Directory accepted key rotation"
        );
        Ok(())
    }
}
