//! # Encryption Module
//!
//! Authenticated encryption for message payloads, wrapped conversation keys
//! and data at rest.
//!
//! ## Key Wrapping Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KEY WRAPPING FLOW                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SENDER (device setting up or rotating a conversation)                 │
//! │                                                                         │
//! │  Step 1: Encapsulate to the recipient device bundle                    │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  (kem_ciphertext, shared_secret) =                           │       │
//! │  │      KeyPairService::encapsulate(recipient, algorithm)       │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Step 2: Seal the conversation key                                     │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  AEAD(                                                       │       │
//! │  │    key   = shared_secret,                                   │       │
//! │  │    nonce = random 12 bytes,                                 │       │
//! │  │    pt    = conversation_key,                                │       │
//! │  │    aad   = "sigil-key-wrap-v1" || context                   │       │
//! │  │  )                                                          │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Output: WrappedKey { algorithm, kem_ciphertext, nonce, ciphertext }   │
//! │                                                                         │
//! │  RECIPIENT                                                             │
//! │                                                                         │
//! │  decapsulate(kem_ciphertext) → shared_secret → AEAD open               │
//! │  (any mismatch → IntegrityCheckFailed)                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! | Property | Guarantee |
//! |----------|-----------|
//! | Confidentiality | AES-256-GCM or ChaCha20-Poly1305 with a 256-bit key |
//! | Integrity | 128-bit tag; any modification is detected |
//! | Context Binding | AAD ties a wrapped key to conversation, version and device |
//! | Nonces | Random 96-bit, never reused under one key |

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::algorithm::{AeadCipher, Algorithm};
use super::keys::{KemCiphertext, KeyPairService, PrivateKeyBundle, PublicKeyBundle};
use super::kdf::domain;
use crate::encoding::{base64_array, base64_bytes};
use crate::error::{Error, Result};

/// Size of the AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce (number used once)
///
/// **NEVER reuse a nonce with the same key!** Nonces are random, which is
/// safe for up to 2^32 messages per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// A 256-bit symmetric key
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Ciphertext with its detached tag
#[derive(Debug, Clone)]
pub struct Sealed {
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Encrypt with a fresh random nonce, returning the tag separately
pub fn encrypt(
    cipher: AeadCipher,
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed> {
    let nonce = Nonce::random();
    let (ciphertext, tag) = encrypt_with_nonce(cipher, key, &nonce, plaintext, aad)?;
    Ok(Sealed {
        nonce,
        ciphertext,
        tag,
    })
}

/// Encrypt with a caller-supplied nonce
pub fn encrypt_with_nonce(
    cipher: AeadCipher,
    key: &EncryptionKey,
    nonce: &Nonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let mut buffer = plaintext.to_vec();
    let tag = match cipher {
        AeadCipher::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;
            aead.encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce.0), aad, &mut buffer)
                .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?
        }
        AeadCipher::ChaCha20Poly1305 => {
            let aead = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;
            aead.encrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                aad,
                &mut buffer,
            )
            .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?
        }
    };

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buffer, tag_bytes))
}

/// Decrypt and verify a detached-tag ciphertext
///
/// ## Errors
///
/// Returns `IntegrityCheckFailed` if the ciphertext, tag, AAD, nonce or key
/// do not match. No plaintext is returned in that case.
pub fn decrypt(
    cipher: AeadCipher,
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    let verified = match cipher {
        AeadCipher::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|e| Error::InvalidKey(format!("Invalid key: {}", e)))?;
            aead.decrypt_in_place_detached(
                aes_gcm::Nonce::from_slice(&nonce.0),
                aad,
                buffer.as_mut_slice(),
                aes_gcm::Tag::from_slice(tag),
            )
        }
        AeadCipher::ChaCha20Poly1305 => {
            let aead = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|e| Error::InvalidKey(format!("Invalid key: {}", e)))?;
            aead.decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(&nonce.0),
                aad,
                buffer.as_mut_slice(),
                chacha20poly1305::Tag::from_slice(tag),
            )
        }
    };

    verified.map_err(|_| {
        Error::IntegrityCheckFailed("Decryption failed: authentication tag mismatch".into())
    })?;

    Ok(std::mem::take(&mut *buffer))
}

/// Seal data at rest as `nonce || ciphertext || tag` with AES-256-GCM
pub fn seal_blob(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let sealed = encrypt(AeadCipher::Aes256Gcm, key, plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len() + TAG_SIZE);
    out.extend_from_slice(&sealed.nonce.0);
    out.extend_from_slice(&sealed.ciphertext);
    out.extend_from_slice(&sealed.tag);
    Ok(out)
}

/// Open a blob produced by [`seal_blob`]
pub fn open_blob(key: &EncryptionKey, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::IntegrityCheckFailed("Sealed blob too short".into()));
    }
    let (nonce, rest) = blob.split_at(NONCE_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce);
    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag);

    decrypt(
        AeadCipher::Aes256Gcm,
        key,
        &Nonce(nonce_bytes),
        ciphertext,
        &tag_bytes,
        aad,
    )
}

// ============================================================================
// WRAPPED KEYS
// ============================================================================

/// A 32-byte key encrypted to one recipient device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub algorithm: Algorithm,
    pub kem_ciphertext: KemCiphertext,
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    /// Sealed key followed by its tag
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

fn wrap_aad(context: &[u8]) -> Vec<u8> {
    let mut aad = domain::KEY_WRAP.to_vec();
    aad.extend_from_slice(context);
    aad
}

/// Encrypt `key` to a recipient bundle
///
/// `context` is bound as associated data; the recipient must present the
/// same context to unwrap.
pub fn wrap_key(
    service: &KeyPairService,
    recipient: &PublicKeyBundle,
    algorithm: Algorithm,
    key: &[u8; KEY_SIZE],
    context: &[u8],
) -> Result<WrappedKey> {
    let (kem_ciphertext, shared) = service.encapsulate(recipient, algorithm)?;
    let wrapping_key = EncryptionKey::from_bytes(*shared.as_bytes());

    let sealed = encrypt(algorithm.aead(), &wrapping_key, key, &wrap_aad(context))?;
    let mut ciphertext = sealed.ciphertext;
    ciphertext.extend_from_slice(&sealed.tag);

    Ok(WrappedKey {
        algorithm,
        kem_ciphertext,
        nonce: sealed.nonce.0,
        ciphertext,
    })
}

/// Recover a key wrapped by [`wrap_key`]
pub fn unwrap_key(
    service: &KeyPairService,
    wrapped: &WrappedKey,
    local_private: &PrivateKeyBundle,
    context: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.ciphertext.len() != KEY_SIZE + TAG_SIZE {
        return Err(Error::IntegrityCheckFailed("Wrapped key has the wrong length".into()));
    }

    let shared = service.decapsulate(&wrapped.kem_ciphertext, local_private, wrapped.algorithm)?;
    let wrapping_key = EncryptionKey::from_bytes(*shared.as_bytes());

    let (ciphertext, tag) = wrapped.ciphertext.split_at(KEY_SIZE);
    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag);

    let plaintext = Zeroizing::new(decrypt(
        wrapped.algorithm.aead(),
        &wrapping_key,
        &Nonce(wrapped.nonce),
        ciphertext,
        &tag_bytes,
        &wrap_aad(context),
    )?);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_both_ciphers() {
        for cipher in [AeadCipher::Aes256Gcm, AeadCipher::ChaCha20Poly1305] {
            let key = EncryptionKey::generate();
            let sealed = encrypt(cipher, &key, b"Hello, Bob!", b"header").unwrap();
            assert_ne!(sealed.ciphertext, b"Hello, Bob!");

            let plaintext =
                decrypt(cipher, &key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"header")
                    .unwrap();
            assert_eq!(plaintext, b"Hello, Bob!");
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate();
        let mut sealed = encrypt(AeadCipher::Aes256Gcm, &key, b"secret", b"").unwrap();
        sealed.ciphertext[0] ^= 0x01;

        let err = decrypt(
            AeadCipher::Aes256Gcm,
            &key,
            &sealed.nonce,
            &sealed.ciphertext,
            &sealed.tag,
            b"",
        )
        .unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = EncryptionKey::generate();
        let sealed = encrypt(AeadCipher::ChaCha20Poly1305, &key, b"secret", b"conv-1").unwrap();
        assert!(decrypt(
            AeadCipher::ChaCha20Poly1305,
            &key,
            &sealed.nonce,
            &sealed.ciphertext,
            &sealed.tag,
            b"conv-2",
        )
        .is_err());
    }

    #[test]
    fn test_blob_seal_open() {
        let key = EncryptionKey::generate();
        let blob = seal_blob(&key, b"at rest", b"item").unwrap();
        assert_eq!(open_blob(&key, &blob, b"item").unwrap(), b"at rest");

        let other = EncryptionKey::generate();
        assert!(open_blob(&other, &blob, b"item").is_err());
        assert!(open_blob(&key, &blob[..10], b"item").is_err());
    }

    #[test]
    fn test_wrap_unwrap_key() {
        let service = KeyPairService::new();
        for algorithm in [Algorithm::X25519Aes256Gcm, Algorithm::X25519Kyber768ChaCha20Poly1305] {
            let recipient = service.generate_key_pair(algorithm).unwrap();
            let key = [42u8; KEY_SIZE];

            let wrapped = wrap_key(&service, &recipient.public, algorithm, &key, b"conv-1:v1").unwrap();
            let unwrapped = unwrap_key(&service, &wrapped, &recipient.private, b"conv-1:v1").unwrap();
            assert_eq!(*unwrapped, key);

            // Same key under another context is rejected
            let err = unwrap_key(&service, &wrapped, &recipient.private, b"conv-1:v2").unwrap_err();
            assert!(matches!(err, Error::IntegrityCheckFailed(_)));
        }
    }

    #[test]
    fn test_wrapped_key_json_shape() {
        let service = KeyPairService::new();
        let recipient = service.generate_key_pair(Algorithm::X25519Aes256Gcm).unwrap();
        let wrapped = wrap_key(&service, &recipient.public, Algorithm::X25519Aes256Gcm, &[1u8; 32], b"")
            .unwrap();

        let json = serde_json::to_string(&wrapped).unwrap();
        assert!(json.contains("\"x25519-aes256gcm\""));
        let parsed: WrappedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, wrapped);
    }
}
