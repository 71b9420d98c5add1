//! # Secure Storage
//!
//! Byte-level store for sensitive data like private keys and conversation
//! keys.
//!
//! ## Backends
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SECURE STORAGE                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SecureStore                                                    │   │
//! │  │                                                                 │   │
//! │  │  • store(key, value)   - Store (encrypted if keyed)            │   │
//! │  │  • retrieve(key)       - Retrieve and decrypt                  │   │
//! │  │  • delete(key)         - Remove an item                        │   │
//! │  │  • keys_with_prefix(p) - Enumerate items                       │   │
//! │  │  • lock() / unlock()   - Refuse all access while locked        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌───────────────┐  ┌───────────────────────────────┐                  │
//! │  │    Memory     │  │   Directory                   │                  │
//! │  │               │  │                               │                  │
//! │  │ - Tests       │  │ - One file per item           │                  │
//! │  │ - Ephemeral   │  │ - Hex file names              │                  │
//! │  │   sessions    │  │ - Atomic write via rename     │                  │
//! │  └───────────────┘  └───────────────────────────────┘                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! With an encryption key, every value is sealed with AES-256-GCM using the
//! item name as associated data, so values cannot be swapped between names.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::crypto::{open_blob, seal_blob, EncryptionKey};
use crate::error::{Error, Result};

enum Backend {
    Memory(RwLock<HashMap<String, Vec<u8>>>),
    Directory(PathBuf),
}

/// Secure storage for key material
pub struct SecureStore {
    backend: Backend,

    /// Optional encryption key for data at rest
    encryption_key: Option<EncryptionKey>,

    locked: AtomicBool,
}

impl SecureStore {
    /// Create an in-memory store
    pub fn new() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            encryption_key: None,
            locked: AtomicBool::new(false),
        }
    }

    /// Create a store persisted under `dir`, one file per item
    pub fn in_directory(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::StorageUnavailable(format!("Cannot create {}: {}", dir.display(), e)))?;
        Ok(Self {
            backend: Backend::Directory(dir),
            encryption_key: None,
            locked: AtomicBool::new(false),
        })
    }

    /// Encrypt every value at rest with `key`
    pub fn with_encryption(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(EncryptionKey::from_bytes(key));
        self
    }

    /// Refuse all access until [`unlock`](Self::unlock)
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
        tracing::info!("Secure store locked");
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        tracing::info!("Secure store unlocked");
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Fail with `StorageUnavailable` while locked
    pub fn ensure_available(&self) -> Result<()> {
        if self.is_locked() {
            Err(Error::StorageUnavailable("Secure store is locked".into()))
        } else {
            Ok(())
        }
    }

    /// Store data securely
    pub fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_available()?;

        let data = match self.encryption_key {
            Some(ref enc_key) => seal_blob(enc_key, value, key.as_bytes())?,
            None => value.to_vec(),
        };

        self.store_raw(key, &data)
    }

    /// Retrieve data, decrypting if the store is keyed
    pub fn retrieve(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.ensure_available()?;

        let data = match self.retrieve_raw(key)? {
            Some(d) => d,
            None => return Ok(None),
        };

        let result = match self.encryption_key {
            Some(ref enc_key) => {
                let plaintext = open_blob(enc_key, &data, key.as_bytes()).map_err(|_| {
                    Error::StorageCorrupted(format!("Item {} failed to decrypt", key))
                })?;
                Zeroizing::new(plaintext)
            }
            None => Zeroizing::new(data),
        };

        Ok(Some(result))
    }

    /// Delete an item, returning whether it existed
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        self.delete_raw(key)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.keys_raw()?.iter().any(|k| k == key))
    }

    /// Every item name starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let mut keys: Vec<String> = self
            .keys_raw()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete every item starting with `prefix`, returning how many went
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.keys_with_prefix(prefix)?;
        for key in &keys {
            self.delete_raw(key)?;
        }
        Ok(keys.len())
    }

    // ========================================================================
    // BACKEND IMPLEMENTATIONS
    // ========================================================================

    fn store_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        match &self.backend {
            Backend::Memory(memory) => {
                memory.write().insert(key.to_string(), value.to_vec());
                Ok(())
            }
            Backend::Directory(dir) => {
                let path = dir.join(hex::encode(key));
                let tmp = dir.join(format!("{}.tmp", hex::encode(key)));
                fs::write(&tmp, value)?;
                fs::rename(&tmp, &path)?;
                Ok(())
            }
        }
    }

    fn retrieve_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Memory(memory) => Ok(memory.read().get(key).cloned()),
            Backend::Directory(dir) => match fs::read(dir.join(hex::encode(key))) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn delete_raw(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Memory(memory) => Ok(memory.write().remove(key).is_some()),
            Backend::Directory(dir) => match fs::remove_file(dir.join(hex::encode(key))) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn keys_raw(&self) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Memory(memory) => Ok(memory.read().keys().cloned().collect()),
            Backend::Directory(dir) => {
                let mut keys = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let name = entry?.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if name.ends_with(".tmp") {
                        continue;
                    }
                    if let Some(key) = hex::decode(name).ok().and_then(|b| String::from_utf8(b).ok()) {
                        keys.push(key);
                    }
                }
                Ok(keys)
            }
        }
    }
}

impl Default for SecureStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
