//! # Cryptography Module
//!
//! All cryptographic primitives used by Sigil Core. Nothing outside this
//! module touches a cipher, KEM or KDF directly.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    KEY HIERARCHY                                │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  Device (long-term)                                            │   │
//! │  │  ┌─────────────────┐         ┌──────────────────────────┐      │   │
//! │  │  │  Signing Key    │         │ KEM bundle               │      │   │
//! │  │  │  (Ed25519)      │         │ (X25519 / Kyber768 /     │      │   │
//! │  │  │                 │         │  Kyber1024)              │      │   │
//! │  │  │ • Envelopes     │         │ • Receives wrapped       │      │   │
//! │  │  │ • Negotiations  │         │   conversation keys      │      │   │
//! │  │  │ • Fingerprint   │         │                          │      │   │
//! │  │  └─────────────────┘         └──────────────────────────┘      │   │
//! │  │                                                                 │   │
//! │  │  Conversation (per version)                                    │   │
//! │  │  ┌─────────────────────────────────────────────────────────┐   │   │
//! │  │  │  Conversation Key (random 256 bits)                      │   │   │
//! │  │  │        │                                                 │   │   │
//! │  │  │        ├──► Ratchet root ──► per-sender chains ──► msg keys  │   │
//! │  │  │        └──► Call media keys                              │   │   │
//! │  │  └─────────────────────────────────────────────────────────┘   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | Ed25519 | Device signatures |
//! | X25519 | Classical key encapsulation |
//! | Kyber768 / Kyber1024 | Post-quantum key encapsulation |
//! | AES-256-GCM / ChaCha20-Poly1305 | Payload and key wrapping AEAD |
//! | HKDF-SHA256 | Key derivation and KEM combining |
//! | HMAC-SHA256 | Ratchet chain steps, content hashes |
//! | Argon2id | Backup password derivation |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: All secret keys are zeroized when dropped
//! 2. **Constant-Time Operations**: dalek and RustCrypto implementations
//! 3. **Secure Random**: `rand::rngs::OsRng` for all key and nonce generation
//! 4. **No Key Reuse**: Unique nonces per encryption, single-use message keys

mod algorithm;
mod encryption;
pub mod kdf;
mod keys;
mod signing;

pub use algorithm::{AeadCipher, Algorithm, AlgorithmFamily, CapabilitySet, KemKind};
pub use encryption::{
    decrypt, encrypt, encrypt_with_nonce, open_blob, seal_blob, unwrap_key, wrap_key,
    EncryptionKey, Nonce, Sealed, WrappedKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
pub use keys::{
    DeviceKeys, KemCiphertext, KeyPair, KeyPairService, PrivateKeyBundle, PublicKeyBundle,
    SharedSecret, SigningKeyPair,
};
pub(crate) use keys::StoredDeviceKeys;
pub use signing::{sign, verify, Signature, Signed, SIGNATURE_SIZE};

/// Size of Ed25519 public keys in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;
