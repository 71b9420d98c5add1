//! # Secure Key Store
//!
//! Typed access to device keys, conversation keys and the fingerprint cache,
//! plus password-encrypted backups.
//!
//! ## Item Layout
//!
//! | Item | Name |
//! |------|------|
//! | Device keys | `sigil.device.{user}` |
//! | Conversation key | `sigil.conv.{user}.{conversation}.{version:010}` |
//! | Fingerprint cache | `sigil.fingerprints.{user}` |
//!
//! ## Backup Blob
//!
//! ```text
//! ┌────────┬─────────┬───────────┬───────────┬───────────────────────────┐
//! │ "SGLB" │ version │ salt (16) │ nonce (12)│ AES-256-GCM(bincode bundle)│
//! │ 4 B    │ 1 B     │           │           │ ciphertext || tag         │
//! └────────┴─────────┴───────────┴───────────┴───────────────────────────┘
//!
//! sealing key = Argon2id(password, salt)
//! aad         = magic || version || salt
//! ```
//!
//! The password policy is checked before any derivation work.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::SecureStore;
use crate::config::BackupConfig;
use crate::crypto::kdf::{derive_password_key, PASSWORD_SALT_SIZE};
use crate::crypto::{
    decrypt, encrypt, AeadCipher, Algorithm, DeviceKeys, EncryptionKey, Nonce, StoredDeviceKeys,
    NONCE_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};

const BACKUP_MAGIC: &[u8; 4] = b"SGLB";
const BACKUP_VERSION: u8 = 1;
const BACKUP_HEADER_SIZE: usize = 4 + 1 + PASSWORD_SALT_SIZE;

/// A conversation key as persisted locally
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKeyRecord {
    #[zeroize(skip)]
    pub conversation_id: String,
    #[zeroize(skip)]
    pub version: u32,
    #[zeroize(skip)]
    pub algorithm: Algorithm,
    pub key: [u8; 32],
    /// Devices the version was set up for
    #[zeroize(skip)]
    pub participants: Vec<String>,
    /// Unix milliseconds
    #[zeroize(skip)]
    pub created_at: i64,
}

impl std::fmt::Debug for ConversationKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationKeyRecord")
            .field("conversation_id", &self.conversation_id)
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .field("participants", &self.participants)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct BackupBundle {
    user_id: String,
    device_keys: Option<StoredDeviceKeys>,
    conversation_keys: Vec<ConversationKeyRecord>,
    created_at: i64,
}

/// What a restore wrote back into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub user_id: String,
    /// Ed25519 public key of the restored device keys, if present
    pub signing_public_key: Option<[u8; 32]>,
    /// Restored versions per conversation
    pub conversations: BTreeMap<String, Vec<u32>>,
}

/// Durable local store for private keys and conversation keys
///
/// Decrypted device keys are only handed out inside
/// [`with_private_key`](Self::with_private_key) and dropped (zeroized) when
/// the closure returns.
#[derive(Clone)]
pub struct SecureKeyStore {
    store: Arc<SecureStore>,
    backup: BackupConfig,
}

impl SecureKeyStore {
    pub fn new(store: Arc<SecureStore>, backup: BackupConfig) -> Self {
        Self { store, backup }
    }

    /// In-memory store with the given backup policy
    pub fn in_memory(backup: BackupConfig) -> Self {
        Self::new(Arc::new(SecureStore::new()), backup)
    }

    /// The underlying byte store
    pub fn backend(&self) -> &SecureStore {
        &self.store
    }

    fn device_item(user_id: &str) -> String {
        format!("sigil.device.{}", user_id)
    }

    fn conversation_prefix(user_id: &str, conversation_id: &str) -> String {
        format!("sigil.conv.{}.{}.", user_id, conversation_id)
    }

    fn conversation_item(user_id: &str, conversation_id: &str, version: u32) -> String {
        format!("{}{:010}", Self::conversation_prefix(user_id, conversation_id), version)
    }

    fn fingerprint_item(user_id: &str) -> String {
        format!("sigil.fingerprints.{}", user_id)
    }

    // ========================================================================
    // DEVICE KEYS
    // ========================================================================

    /// Persist the local device keys for `user_id`
    pub fn store_private_key(&self, user_id: &str, keys: &DeviceKeys) -> Result<()> {
        let stored = keys.to_stored();
        let bytes = zeroize::Zeroizing::new(bincode::serialize(&stored)?);
        self.store.store(&Self::device_item(user_id), &bytes)?;
        tracing::info!(user = user_id, "Stored device keys");
        Ok(())
    }

    pub fn has_private_key(&self, user_id: &str) -> Result<bool> {
        self.store.exists(&Self::device_item(user_id))
    }

    /// Run `f` with the decrypted device keys
    ///
    /// The keys are reconstructed for the call and zeroized afterwards.
    pub fn with_private_key<R, F>(&self, user_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&DeviceKeys) -> Result<R>,
    {
        let bytes = self
            .store
            .retrieve(&Self::device_item(user_id))?
            .ok_or_else(|| Error::StorageNotFound(format!("No device keys for {}", user_id)))?;
        let stored: StoredDeviceKeys = bincode::deserialize(&bytes)
            .map_err(|e| Error::StorageCorrupted(format!("Device keys: {}", e)))?;
        let keys = DeviceKeys::from_stored(&stored);
        f(&keys)
    }

    // ========================================================================
    // CONVERSATION KEYS
    // ========================================================================

    pub fn store_conversation_key(&self, user_id: &str, record: &ConversationKeyRecord) -> Result<()> {
        let bytes = zeroize::Zeroizing::new(bincode::serialize(record)?);
        self.store.store(
            &Self::conversation_item(user_id, &record.conversation_id, record.version),
            &bytes,
        )?;
        tracing::debug!(
            user = user_id,
            conversation = %record.conversation_id,
            version = record.version,
            "Stored conversation key"
        );
        Ok(())
    }

    pub fn get_conversation_key(
        &self,
        user_id: &str,
        conversation_id: &str,
        version: u32,
    ) -> Result<Option<ConversationKeyRecord>> {
        self.load_record(&Self::conversation_item(user_id, conversation_id, version))
    }

    /// Highest stored version for a conversation
    pub fn latest_conversation_key(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationKeyRecord>> {
        // Zero-padded versions sort numerically
        let items = self
            .store
            .keys_with_prefix(&Self::conversation_prefix(user_id, conversation_id))?;
        match items.last() {
            Some(item) => self.load_record(item),
            None => Ok(None),
        }
    }

    /// Stored versions for a conversation, ascending
    pub fn conversation_versions(&self, user_id: &str, conversation_id: &str) -> Result<Vec<u32>> {
        let prefix = Self::conversation_prefix(user_id, conversation_id);
        Ok(self
            .store
            .keys_with_prefix(&prefix)?
            .iter()
            .filter_map(|item| item[prefix.len()..].parse().ok())
            .collect())
    }

    /// Forget every version of a conversation
    pub fn delete_conversation(&self, user_id: &str, conversation_id: &str) -> Result<usize> {
        self.store
            .delete_prefix(&Self::conversation_prefix(user_id, conversation_id))
    }

    fn load_record(&self, item: &str) -> Result<Option<ConversationKeyRecord>> {
        match self.store.retrieve(item)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| Error::StorageCorrupted(format!("{}: {}", item, e))),
            None => Ok(None),
        }
    }

    /// Newest stored version of every conversation, ordered by conversation id
    pub fn latest_conversation_keys(&self, user_id: &str) -> Result<Vec<ConversationKeyRecord>> {
        let mut latest: BTreeMap<String, ConversationKeyRecord> = BTreeMap::new();
        for record in self.all_conversation_records(user_id)? {
            let newer = latest
                .get(&record.conversation_id)
                .map_or(true, |existing| record.version > existing.version);
            if newer {
                latest.insert(record.conversation_id.clone(), record);
            }
        }
        Ok(latest.into_values().collect())
    }

    fn all_conversation_records(&self, user_id: &str) -> Result<Vec<ConversationKeyRecord>> {
        let prefix = format!("sigil.conv.{}.", user_id);
        let mut records = Vec::new();
        for item in self.store.keys_with_prefix(&prefix)? {
            if let Some(record) = self.load_record(&item)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // ========================================================================
    // FINGERPRINT CACHE
    // ========================================================================

    /// Persist the fingerprint → device id map
    pub fn store_fingerprints(&self, user_id: &str, fingerprints: &HashMap<String, String>) -> Result<()> {
        let sorted: BTreeMap<&String, &String> = fingerprints.iter().collect();
        let bytes = bincode::serialize(&sorted)?;
        self.store.store(&Self::fingerprint_item(user_id), &bytes)
    }

    pub fn load_fingerprints(&self, user_id: &str) -> Result<HashMap<String, String>> {
        match self.store.retrieve(&Self::fingerprint_item(user_id))? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::StorageCorrupted(format!("Fingerprint cache: {}", e))),
            None => Ok(HashMap::new()),
        }
    }

    /// Remove every item belonging to `user_id`
    pub fn clear_all(&self, user_id: &str) -> Result<()> {
        self.store.delete(&Self::device_item(user_id))?;
        self.store.delete(&Self::fingerprint_item(user_id))?;
        let removed = self.store.delete_prefix(&format!("sigil.conv.{}.", user_id))?;
        tracing::info!(user = user_id, conversation_keys = removed, "Cleared key store");
        Ok(())
    }

    // ========================================================================
    // BACKUPS
    // ========================================================================

    fn check_password(&self, password: &str) -> Result<()> {
        if password.chars().count() < self.backup.min_password_length {
            return Err(Error::WeakBackupPassword {
                min_length: self.backup.min_password_length,
            });
        }
        Ok(())
    }

    /// Export device and conversation keys as a password-encrypted blob
    pub fn create_backup(&self, user_id: &str, password: &str) -> Result<Vec<u8>> {
        self.check_password(password)?;

        let device_keys = match self.store.retrieve(&Self::device_item(user_id))? {
            Some(bytes) => Some(
                bincode::deserialize::<StoredDeviceKeys>(&bytes)
                    .map_err(|e| Error::StorageCorrupted(format!("Device keys: {}", e)))?,
            ),
            None => None,
        };
        let bundle = BackupBundle {
            user_id: user_id.to_string(),
            device_keys,
            conversation_keys: self.all_conversation_records(user_id)?,
            created_at: crate::time::now_timestamp_millis(),
        };
        let plaintext = zeroize::Zeroizing::new(bincode::serialize(&bundle)?);

        let mut salt = [0u8; PASSWORD_SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = derive_password_key(password.as_bytes(), &salt, &self.backup)?;

        let mut header = Vec::with_capacity(BACKUP_HEADER_SIZE);
        header.extend_from_slice(BACKUP_MAGIC);
        header.push(BACKUP_VERSION);
        header.extend_from_slice(&salt);

        let sealed = encrypt(
            AeadCipher::Aes256Gcm,
            &EncryptionKey::from_bytes(*key),
            &plaintext,
            &header,
        )?;

        let mut blob = header;
        blob.extend_from_slice(&sealed.nonce.0);
        blob.extend_from_slice(&sealed.ciphertext);
        blob.extend_from_slice(&sealed.tag);

        tracing::info!(
            user = user_id,
            conversation_keys = bundle.conversation_keys.len(),
            "Created backup"
        );
        Ok(blob)
    }

    /// Decrypt a backup and write its keys back into the store
    ///
    /// Nothing is written unless the whole blob decrypts and decodes.
    pub fn restore_from_backup(&self, blob: &[u8], password: &str) -> Result<RestoreSummary> {
        self.check_password(password)?;

        if blob.len() < BACKUP_HEADER_SIZE + NONCE_SIZE + TAG_SIZE || &blob[..4] != BACKUP_MAGIC {
            return Err(Error::IntegrityCheckFailed("Not a backup blob".into()));
        }
        if blob[4] != BACKUP_VERSION {
            return Err(Error::IntegrityCheckFailed(format!(
                "Unsupported backup version {}",
                blob[4]
            )));
        }

        let (header, rest) = blob.split_at(BACKUP_HEADER_SIZE);
        let (nonce, rest) = rest.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut salt = [0u8; PASSWORD_SALT_SIZE];
        salt.copy_from_slice(&header[5..]);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag);

        let key = derive_password_key(password.as_bytes(), &salt, &self.backup)?;
        let plaintext = zeroize::Zeroizing::new(
            decrypt(
                AeadCipher::Aes256Gcm,
                &EncryptionKey::from_bytes(*key),
                &Nonce(nonce_bytes),
                ciphertext,
                &tag_bytes,
                header,
            )
            .map_err(|_| Error::BackupDecryptionFailed)?,
        );

        let bundle: BackupBundle =
            bincode::deserialize(&plaintext).map_err(|_| Error::BackupDecryptionFailed)?;

        self.store.ensure_available()?;
        let mut written: Vec<String> = Vec::new();
        let outcome = self.write_bundle(&bundle, &mut written);
        if let Err(e) = outcome {
            for item in &written {
                let _ = self.store.delete(item);
            }
            return Err(e);
        }

        let mut conversations: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for record in &bundle.conversation_keys {
            conversations
                .entry(record.conversation_id.clone())
                .or_default()
                .push(record.version);
        }

        let signing_public_key = bundle
            .device_keys
            .as_ref()
            .map(|stored| DeviceKeys::from_stored(stored).signing().public_bytes());

        tracing::info!(
            user = %bundle.user_id,
            conversation_keys = bundle.conversation_keys.len(),
            "Restored backup"
        );

        Ok(RestoreSummary {
            user_id: bundle.user_id.clone(),
            signing_public_key,
            conversations,
        })
    }

    fn write_bundle(&self, bundle: &BackupBundle, written: &mut Vec<String>) -> Result<()> {
        if let Some(stored) = &bundle.device_keys {
            let keys = DeviceKeys::from_stored(stored);
            self.store_private_key(&bundle.user_id, &keys)?;
            written.push(Self::device_item(&bundle.user_id));
        }
        for record in &bundle.conversation_keys {
            self.store_conversation_key(&bundle.user_id, record)?;
            written.push(Self::conversation_item(
                &bundle.user_id,
                &record.conversation_id,
                record.version,
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CapabilitySet, KeyPairService};

    fn fast_backup() -> BackupConfig {
        BackupConfig {
            argon2_memory_kib: 64,
            argon2_iterations: 1,
            ..BackupConfig::default()
        }
    }

    fn record(conversation_id: &str, version: u32, byte: u8) -> ConversationKeyRecord {
        ConversationKeyRecord {
            conversation_id: conversation_id.into(),
            version,
            algorithm: Algorithm::X25519Aes256Gcm,
            key: [byte; 32],
            participants: vec!["alice-laptop".into(), "bob-phone".into()],
            created_at: 0,
        }
    }

    fn device_keys() -> DeviceKeys {
        DeviceKeys::generate(
            &KeyPairService::new(),
            &CapabilitySet::new([Algorithm::X25519Aes256Gcm]),
        )
        .unwrap()
    }

    #[test]
    fn test_scoped_private_key_access() {
        let store = SecureKeyStore::in_memory(fast_backup());
        let keys = device_keys();
        store.store_private_key("alice", &keys).unwrap();

        let public = store
            .with_private_key("alice", |k| Ok(k.signing().public_bytes()))
            .unwrap();
        assert_eq!(public, keys.signing().public_bytes());

        let err = store.with_private_key("bob", |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::StorageNotFound(_)));
    }

    #[test]
    fn test_conversation_versions() {
        let store = SecureKeyStore::in_memory(fast_backup());
        store.store_conversation_key("alice", &record("conv-1", 2, 2)).unwrap();
        store.store_conversation_key("alice", &record("conv-1", 10, 10)).unwrap();
        store.store_conversation_key("alice", &record("conv-1", 1, 1)).unwrap();
        store.store_conversation_key("alice", &record("conv-10", 5, 5)).unwrap();

        assert_eq!(store.conversation_versions("alice", "conv-1").unwrap(), vec![1, 2, 10]);
        let latest = store.latest_conversation_key("alice", "conv-1").unwrap().unwrap();
        assert_eq!(latest.version, 10);
        assert_eq!(latest.key, [10u8; 32]);

        let old = store.get_conversation_key("alice", "conv-1", 1).unwrap().unwrap();
        assert_eq!(old.key, [1u8; 32]);
        assert!(store.get_conversation_key("alice", "conv-1", 3).unwrap().is_none());
    }

    #[test]
    fn test_latest_key_per_conversation() {
        let store = SecureKeyStore::in_memory(fast_backup());
        store.store_conversation_key("alice", &record("conv-1", 1, 1)).unwrap();
        store.store_conversation_key("alice", &record("conv-1", 3, 3)).unwrap();
        store.store_conversation_key("alice", &record("conv-2", 2, 2)).unwrap();
        store.store_conversation_key("bob", &record("conv-3", 1, 1)).unwrap();

        let latest = store.latest_conversation_keys("alice").unwrap();
        let summary: Vec<(&str, u32)> = latest
            .iter()
            .map(|r| (r.conversation_id.as_str(), r.version))
            .collect();
        assert_eq!(summary, vec![("conv-1", 3), ("conv-2", 2)]);
        assert_eq!(latest[0].participants, vec!["alice-laptop", "bob-phone"]);
    }

    #[test]
    fn test_fingerprint_cache() {
        let store = SecureKeyStore::in_memory(fast_backup());
        let mut map = HashMap::new();
        map.insert("abcd".to_string(), "dev-1".to_string());
        store.store_fingerprints("alice", &map).unwrap();
        assert_eq!(store.load_fingerprints("alice").unwrap(), map);
        assert!(store.load_fingerprints("bob").unwrap().is_empty());
    }

    #[test]
    fn test_clear_all() {
        let store = SecureKeyStore::in_memory(fast_backup());
        store.store_private_key("alice", &device_keys()).unwrap();
        store.store_conversation_key("alice", &record("c", 1, 1)).unwrap();
        store.store_conversation_key("bob", &record("c", 1, 1)).unwrap();

        store.clear_all("alice").unwrap();
        assert!(!store.has_private_key("alice").unwrap());
        assert!(store.latest_conversation_key("alice", "c").unwrap().is_none());
        assert!(store.latest_conversation_key("bob", "c").unwrap().is_some());
    }

    #[test]
    fn test_weak_password_rejected_before_work() {
        let store = SecureKeyStore::in_memory(fast_backup());
        let err = store.create_backup("alice", "short").unwrap_err();
        assert!(matches!(err, Error::WeakBackupPassword { min_length: 12 }));
    }

    #[test]
    fn test_backup_restore() {
        let source = SecureKeyStore::in_memory(fast_backup());
        let keys = device_keys();
        source.store_private_key("alice", &keys).unwrap();
        source.store_conversation_key("alice", &record("conv-1", 1, 1)).unwrap();
        source.store_conversation_key("alice", &record("conv-1", 2, 2)).unwrap();

        let blob = source.create_backup("alice", "correct horse battery staple").unwrap();
        assert_eq!(&blob[..4], BACKUP_MAGIC);

        let target = SecureKeyStore::in_memory(fast_backup());
        let summary = target
            .restore_from_backup(&blob, "correct horse battery staple")
            .unwrap();

        assert_eq!(summary.user_id, "alice");
        assert_eq!(summary.signing_public_key, Some(keys.signing().public_bytes()));
        assert_eq!(summary.conversations["conv-1"], vec![1, 2]);
        assert_eq!(
            target.get_conversation_key("alice", "conv-1", 2).unwrap().unwrap().key,
            [2u8; 32]
        );
    }

    #[test]
    fn test_wrong_password_writes_nothing() {
        let source = SecureKeyStore::in_memory(fast_backup());
        source.store_private_key("alice", &device_keys()).unwrap();
        source.store_conversation_key("alice", &record("conv-1", 1, 1)).unwrap();
        let blob = source.create_backup("alice", "correct horse battery staple").unwrap();

        let target = SecureKeyStore::in_memory(fast_backup());
        let err = target
            .restore_from_backup(&blob, "incorrect horse battery")
            .unwrap_err();
        assert!(matches!(err, Error::BackupDecryptionFailed));
        assert!(!target.has_private_key("alice").unwrap());
        assert!(target.backend().keys_with_prefix("").unwrap().is_empty());
    }

    #[test]
    fn test_tampered_backup_rejected() {
        let source = SecureKeyStore::in_memory(fast_backup());
        source.store_conversation_key("alice", &record("conv-1", 1, 1)).unwrap();
        let mut blob = source.create_backup("alice", "correct horse battery staple").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;

        let err = source
            .restore_from_backup(&blob, "correct horse battery staple")
            .unwrap_err();
        assert!(matches!(err, Error::BackupDecryptionFailed));

        let err = source
            .restore_from_backup(b"garbage", "correct horse battery staple")
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
    }
}
