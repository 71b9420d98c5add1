//! # Key Derivation Functions
//!
//! Every symmetric key in the system is derived here, each under its own
//! domain-separation label.
//!
//! ## Derivation Map
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      KEY DERIVATION MAP                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  KEM shared secrets (X25519 DH, Kyber, or both)                        │
//! │       │                                                                 │
//! │       └──► HKDF(salt = H(transcript), ikm = ss1 || ss2)                │
//! │                 → 32-byte wrapping key                                  │
//! │                                                                         │
//! │  Conversation key (random, 32 bytes, versioned)                        │
//! │       │                                                                 │
//! │       ├──► HKDF(salt = conversation_id, info = "root" || version)      │
//! │       │        → ratchet root key                                       │
//! │       │             │                                                   │
//! │       │             └──► HKDF(salt = sender_device_id) → chain seed    │
//! │       │                                                                 │
//! │       └──► HKDF(salt = conversation_id, info = "media" || call_id)     │
//! │                → call media key                                         │
//! │                                                                         │
//! │  Message key ──► HKDF(info = "content-hash") → content hash key        │
//! │                                                                         │
//! │  Backup password ──► Argon2id(salt, m, t, p) → backup sealing key      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Considerations
//!
//! | Aspect | Design Choice |
//! |--------|---------------|
//! | KDF Algorithm | HKDF-SHA256 |
//! | Key Separation | Different `info` strings |
//! | KEM Binding | Salt is a hash over the public transcript |
//! | Password KDF | Argon2id v1.3 |
//! | Version String | "-v1" suffix |

use argon2::{Algorithm as Argon2Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::BackupConfig;
use crate::error::{Error, Result};

/// Domain separation strings for HKDF
pub mod domain {
    /// Classical (X25519) KEM output
    pub const KEM_CLASSICAL: &[u8] = b"sigil-kem-classical-v1";

    /// Post-quantum (Kyber) KEM output
    pub const KEM_POST_QUANTUM: &[u8] = b"sigil-kem-pq-v1";

    /// Hybrid KEM combiner
    pub const KEM_HYBRID: &[u8] = b"sigil-kem-hybrid-v1";

    /// Ratchet root key from a conversation key
    pub const RATCHET_ROOT: &[u8] = b"sigil-ratchet-root-v1";

    /// Per-sender chain seed from a ratchet root key
    pub const RATCHET_CHAIN: &[u8] = b"sigil-ratchet-chain-v1";

    /// Call media key from a conversation key
    pub const MEDIA_KEY: &[u8] = b"sigil-media-key-v1";

    /// Content hash key from a message key
    pub const CONTENT_HASH: &[u8] = b"sigil-content-hash-v1";

    /// Associated data prefix for wrapped conversation keys
    pub const KEY_WRAP: &[u8] = b"sigil-key-wrap-v1";

    /// Device fingerprint
    pub const FINGERPRINT: &[u8] = b"sigil-device-fingerprint-v1";
}

/// Length of the random salt stored in backup blobs
pub const PASSWORD_SALT_SIZE: usize = 16;

/// Single HKDF-SHA256 extract-and-expand to 32 bytes
pub fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hkdf.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;
    Ok(okm)
}

/// Hash a sequence of public values with length prefixes so that no two
/// different transcripts collide by concatenation.
pub fn transcript_hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Combine one or more KEM shared secrets into a single key
///
/// ```text
/// ikm  = ss_1 || ss_2 || ...
/// salt = SHA-256(len || ciphertext || len || recipient_public || ...)
/// key  = HKDF-SHA256(salt, ikm, label)
/// ```
///
/// Binding the salt to the ciphertexts and recipient keys means a secret
/// cannot be replayed under a different encapsulation.
pub fn derive_kem_secret(label: &[u8], secrets: &[&[u8]], transcript: &[&[u8]]) -> Result<[u8; 32]> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(secrets.iter().map(|s| s.len()).sum()));
    for secret in secrets {
        ikm.extend_from_slice(secret);
    }
    let salt = transcript_hash(transcript);
    hkdf_sha256(Some(&salt), &ikm, label)
}

/// Ratchet root key for one conversation key version
pub fn derive_root_key(
    conversation_key: &[u8; 32],
    conversation_id: &str,
    key_version: u32,
) -> Result<[u8; 32]> {
    let mut info = domain::RATCHET_ROOT.to_vec();
    info.extend_from_slice(&key_version.to_be_bytes());
    hkdf_sha256(Some(conversation_id.as_bytes()), conversation_key, &info)
}

/// Initial chain key for one sender under a root key
///
/// Every participant derives the same seed for a given sender, so a device
/// can also replay its own sending chain when reading its history.
pub fn derive_chain_seed(root_key: &[u8; 32], sender_device_id: &str) -> Result<[u8; 32]> {
    hkdf_sha256(Some(sender_device_id.as_bytes()), root_key, domain::RATCHET_CHAIN)
}

/// Media key for a call, bound to the conversation key version
pub fn derive_media_key(
    conversation_key: &[u8; 32],
    conversation_id: &str,
    call_id: &str,
    key_version: u32,
) -> Result<[u8; 32]> {
    let mut info = domain::MEDIA_KEY.to_vec();
    info.extend_from_slice(&key_version.to_be_bytes());
    info.extend_from_slice(call_id.as_bytes());
    hkdf_sha256(Some(conversation_id.as_bytes()), conversation_key, &info)
}

/// Key for the keyed content hash of one message
pub fn derive_content_hash_key(message_key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    hkdf_sha256(None, message_key, domain::CONTENT_HASH).map(Zeroizing::new)
}

/// Device fingerprint over its identity inputs
///
/// ```text
/// SHA-256("sigil-device-fingerprint-v1" || user_id || kind || signing_key
///         [|| hardware_attributes])
/// ```
///
/// Returned as 64 lowercase hex characters.
pub fn compute_device_fingerprint(
    user_id: &str,
    device_kind: &str,
    signing_key: &[u8; 32],
    hardware_attributes: Option<&str>,
) -> String {
    let mut parts: Vec<&[u8]> = vec![
        domain::FINGERPRINT,
        user_id.as_bytes(),
        device_kind.as_bytes(),
        &signing_key[..],
    ];
    if let Some(hardware) = hardware_attributes {
        parts.push(hardware.as_bytes());
    }
    hex::encode(transcript_hash(&parts))
}

/// Group a hex fingerprint into blocks of four for display
pub fn format_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).to_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derive a backup sealing key from a password with Argon2id
pub fn derive_password_key(
    password: &[u8],
    salt: &[u8; PASSWORD_SALT_SIZE],
    config: &BackupConfig,
) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(32),
    )
    .map_err(|e| Error::KeyDerivationFailed(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| Error::KeyDerivationFailed(format!("Argon2 failed: {}", e)))?;

    Ok(key)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_domain_separation() {
        let ikm = [7u8; 32];
        let a = hkdf_sha256(None, &ikm, domain::KEM_CLASSICAL).unwrap();
        let b = hkdf_sha256(None, &ikm, domain::KEM_POST_QUANTUM).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transcript_hash_is_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(
            transcript_hash(&[b"ab", b"c"]),
            transcript_hash(&[b"a", b"bc"])
        );
    }

    #[test]
    fn test_kem_secret_bound_to_transcript() {
        let ss = [1u8; 32];
        let a = derive_kem_secret(domain::KEM_HYBRID, &[&ss, &ss], &[b"ct-1"]).unwrap();
        let b = derive_kem_secret(domain::KEM_HYBRID, &[&ss, &ss], &[b"ct-2"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_root_key_depends_on_version() {
        let key = [9u8; 32];
        let v1 = derive_root_key(&key, "conv-1", 1).unwrap();
        let v2 = derive_root_key(&key, "conv-1", 2).unwrap();
        assert_ne!(v1, v2);
        assert_eq!(v1, derive_root_key(&key, "conv-1", 1).unwrap());
    }

    #[test]
    fn test_chain_seed_per_sender() {
        let root = [3u8; 32];
        assert_ne!(
            derive_chain_seed(&root, "device-a").unwrap(),
            derive_chain_seed(&root, "device-b").unwrap()
        );
    }

    #[test]
    fn test_media_key_per_call() {
        let key = [5u8; 32];
        let a = derive_media_key(&key, "conv", "call-1", 1).unwrap();
        let b = derive_media_key(&key, "conv", "call-2", 1).unwrap();
        let c = derive_media_key(&key, "conv", "call-1", 2).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_inputs() {
        let key = [1u8; 32];
        let base = compute_device_fingerprint("alice", "desktop", &key, None);
        assert_eq!(base.len(), 64);
        assert_eq!(base, compute_device_fingerprint("alice", "desktop", &key, None));
        assert_ne!(base, compute_device_fingerprint("alice", "mobile", &key, None));
        assert_ne!(base, compute_device_fingerprint("alice", "desktop", &key, Some("tpm:1234")));
    }

    #[test]
    fn test_format_fingerprint() {
        assert_eq!(format_fingerprint("abcd1234ef"), "ABCD 1234 EF");
    }

    #[test]
    fn test_password_key() {
        let config = BackupConfig {
            argon2_memory_kib: 64,
            argon2_iterations: 1,
            ..BackupConfig::default()
        };
        let salt = [4u8; PASSWORD_SALT_SIZE];
        let a = derive_password_key(b"correct horse battery", &salt, &config).unwrap();
        let b = derive_password_key(b"correct horse battery", &salt, &config).unwrap();
        let c = derive_password_key(b"wrong horse battery", &salt, &config).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }
}
