//! # Storage Module
//!
//! Durable local storage for key material.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SecureKeyStore (typed)                                         │   │
//! │  │  ──────────────────────                                          │   │
//! │  │                                                                 │   │
//! │  │  • Device keys        scoped access via with_private_key       │   │
//! │  │  • Conversation keys  every version, for historical decrypts   │   │
//! │  │  • Fingerprint cache  fingerprint → device id                  │   │
//! │  │  • Backups            Argon2id + AES-256-GCM blob              │   │
//! │  └───────────────────────────────┬─────────────────────────────────┘   │
//! │                                  │                                     │
//! │                                  ▼                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SecureStore (bytes)                                            │   │
//! │  │  ───────────────────                                             │   │
//! │  │                                                                 │   │
//! │  │  Memory or directory backend, optional AES-256-GCM at rest,    │   │
//! │  │  lockable. Locked ⇒ StorageUnavailable.                        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod key_store;
mod secure_store;

pub use key_store::{ConversationKeyRecord, RestoreSummary, SecureKeyStore};
pub use secure_store::SecureStore;
