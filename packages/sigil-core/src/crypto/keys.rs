//! # Key Management
//!
//! Key generation and key encapsulation for every supported algorithm.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SigningKeyPair (Ed25519)                                       │   │
//! │  │                                                                  │   │
//! │  │  • Signs envelopes and negotiation records                      │   │
//! │  │  • Input to the device fingerprint                              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  KEM bundle (PublicKeyBundle / PrivateKeyBundle)                │   │
//! │  │                                                                  │   │
//! │  │  Component      Size (pk / sk)     Used by                       │   │
//! │  │  x25519         32 / 32            classical, hybrid             │   │
//! │  │  kyber768       1184 / 2400        post-quantum, hybrid          │   │
//! │  │  kyber1024      1568 / 3168        post-quantum                  │   │
//! │  │                                                                  │   │
//! │  │  A bundle carries only the components its algorithms need.      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  DeviceKeys (Combined)                                          │   │
//! │  │                                                                  │   │
//! │  │  ┌───────────────┐    ┌───────────────┐                        │   │
//! │  │  │ SigningKeyPair│    │ KEM bundle    │                        │   │
//! │  │  └───────────────┘    └───────────────┘                        │   │
//! │  │                                                                  │   │
//! │  │  The long-term identity of one device.                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Encapsulation
//!
//! ```text
//! classical     eph = X25519 random; ss = DH(eph, peer_x25519)
//!               ciphertext = eph_pub
//! post-quantum  (ss, ct) = Kyber.encapsulate(peer_kyber)
//!               ciphertext = ct
//! hybrid        both of the above; ss = HKDF(ss_x25519 || ss_kyber)
//!
//! Every shared secret is finally passed through HKDF with a salt bound to
//! the ciphertext and the recipient's public key.
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use pqcrypto_kyber::{kyber1024, kyber768};
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::algorithm::{Algorithm, CapabilitySet, KemKind};
use super::kdf::{derive_kem_secret, domain};
use crate::encoding::{base64_bytes_opt, hex_array_opt};
use crate::error::{Error, Result};

/// Ed25519 signing keypair
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    /// Private signing key (secret)
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        Self { secret }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the secret key bytes (for secure storage only)
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    /// Get the verifying key for signature verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.secret.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

/// Public KEM components of a device or key pair
///
/// Contains only public information and can be serialized, transmitted,
/// and stored freely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// X25519 public key (32 bytes)
    #[serde(default, with = "hex_array_opt")]
    pub x25519: Option<[u8; 32]>,

    /// Kyber768 public key
    #[serde(default, with = "base64_bytes_opt")]
    pub kyber768: Option<Vec<u8>>,

    /// Kyber1024 public key
    #[serde(default, with = "base64_bytes_opt")]
    pub kyber1024: Option<Vec<u8>>,
}

impl PublicKeyBundle {
    /// Whether this bundle can receive keys encapsulated with `kem`
    pub fn supports(&self, kem: KemKind) -> bool {
        match kem {
            KemKind::X25519 => self.x25519.is_some(),
            KemKind::Kyber768 => self.kyber768.is_some(),
            KemKind::Kyber1024 => self.kyber1024.is_some(),
            KemKind::X25519Kyber768 => self.x25519.is_some() && self.kyber768.is_some(),
        }
    }

    /// Every algorithm this bundle can receive
    pub fn capabilities(&self) -> CapabilitySet {
        Algorithm::ALL
            .iter()
            .copied()
            .filter(|a| self.supports(a.kem()))
            .collect()
    }

    fn x25519(&self) -> Result<X25519PublicKey> {
        self.x25519
            .map(X25519PublicKey::from)
            .ok_or_else(|| Error::InvalidKey("Bundle has no X25519 public key".into()))
    }
}

/// Private KEM components, owned by the local device only
///
/// Zeroized on drop. Serialized only into the secure key store.
#[derive(Default, Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct PrivateKeyBundle {
    x25519: Option<[u8; 32]>,
    kyber768: Option<Vec<u8>>,
    kyber1024: Option<Vec<u8>>,
}

impl std::fmt::Debug for PrivateKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyBundle")
            .field("x25519", &self.x25519.map(|_| "<redacted>"))
            .field("kyber768", &self.kyber768.as_ref().map(|_| "<redacted>"))
            .field("kyber1024", &self.kyber1024.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An algorithm-specific key pair
pub struct KeyPair {
    pub algorithm: Algorithm,
    pub public: PublicKeyBundle,
    pub private: PrivateKeyBundle,
}

/// Ciphertext produced by [`KeyPairService::encapsulate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemCiphertext {
    /// Ephemeral X25519 public key
    #[serde(default, with = "hex_array_opt")]
    pub x25519_ephemeral: Option<[u8; 32]>,

    /// Kyber ciphertext
    #[serde(default, with = "base64_bytes_opt")]
    pub kyber: Option<Vec<u8>>,
}

/// A 32-byte secret agreed through encapsulation
///
/// Used to seal wrapped keys; zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generates key material and performs KEM operations
///
/// A service only offers the algorithms it was built with; anything else
/// fails with `UnsupportedAlgorithm`.
#[derive(Debug, Clone)]
pub struct KeyPairService {
    enabled: CapabilitySet,
}

impl Default for KeyPairService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPairService {
    /// Service with every algorithm available
    pub fn new() -> Self {
        Self {
            enabled: CapabilitySet::all(),
        }
    }

    /// Service restricted to a subset of algorithms
    pub fn with_algorithms(enabled: CapabilitySet) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> &CapabilitySet {
        &self.enabled
    }

    fn ensure_enabled(&self, algorithm: Algorithm) -> Result<()> {
        if self.enabled.contains(algorithm) {
            Ok(())
        } else {
            Err(Error::UnsupportedAlgorithm(format!(
                "{} is not available in this runtime",
                algorithm
            )))
        }
    }

    /// Generate a fresh key pair for one algorithm
    pub fn generate_key_pair(&self, algorithm: Algorithm) -> Result<KeyPair> {
        self.ensure_enabled(algorithm)?;
        let (public, private) = generate_components(&CapabilitySet::new([algorithm]));
        Ok(KeyPair {
            algorithm,
            public,
            private,
        })
    }

    /// Generate one bundle covering every algorithm in `capabilities`
    pub fn generate_bundle(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<(PublicKeyBundle, PrivateKeyBundle)> {
        for algorithm in capabilities.iter() {
            self.ensure_enabled(algorithm)?;
        }
        Ok(generate_components(capabilities))
    }

    /// Encapsulate a fresh shared secret to a peer's public bundle
    pub fn encapsulate(
        &self,
        peer_public: &PublicKeyBundle,
        algorithm: Algorithm,
    ) -> Result<(KemCiphertext, SharedSecret)> {
        self.ensure_enabled(algorithm)?;

        match algorithm.kem() {
            KemKind::X25519 => {
                let peer = peer_public.x25519()?;
                let (eph_pub, dh) = x25519_encapsulate(&peer)?;
                let secret = derive_kem_secret(
                    domain::KEM_CLASSICAL,
                    &[&dh[..]],
                    &[&eph_pub[..], &peer.as_bytes()[..]],
                )?;
                Ok((
                    KemCiphertext {
                        x25519_ephemeral: Some(eph_pub),
                        kyber: None,
                    },
                    SharedSecret(secret),
                ))
            }
            KemKind::Kyber768 | KemKind::Kyber1024 => {
                let level = KyberLevel::from_kem(algorithm.kem());
                let peer = level.public_key(peer_public)?;
                let (ct, ss) = kyber_encapsulate(level, peer)?;
                let secret =
                    derive_kem_secret(domain::KEM_POST_QUANTUM, &[&ss[..]], &[&ct[..], peer])?;
                Ok((
                    KemCiphertext {
                        x25519_ephemeral: None,
                        kyber: Some(ct),
                    },
                    SharedSecret(secret),
                ))
            }
            KemKind::X25519Kyber768 => {
                let peer_x = peer_public.x25519()?;
                let peer_k = KyberLevel::K768.public_key(peer_public)?;
                let (eph_pub, dh) = x25519_encapsulate(&peer_x)?;
                let (ct, ss) = kyber_encapsulate(KyberLevel::K768, peer_k)?;
                let secret = derive_kem_secret(
                    domain::KEM_HYBRID,
                    &[&dh[..], &ss[..]],
                    &[&eph_pub[..], &peer_x.as_bytes()[..], &ct[..], peer_k],
                )?;
                Ok((
                    KemCiphertext {
                        x25519_ephemeral: Some(eph_pub),
                        kyber: Some(ct),
                    },
                    SharedSecret(secret),
                ))
            }
        }
    }

    /// Recover the shared secret from a ciphertext with the local private bundle
    ///
    /// Kyber decapsulation never fails on a wrong ciphertext; it yields an
    /// unrelated secret, so tampering surfaces at the AEAD layer.
    pub fn decapsulate(
        &self,
        ciphertext: &KemCiphertext,
        local_private: &PrivateKeyBundle,
        algorithm: Algorithm,
    ) -> Result<SharedSecret> {
        self.ensure_enabled(algorithm)?;

        match algorithm.kem() {
            KemKind::X25519 => {
                let (local_pub, dh) = x25519_decapsulate(ciphertext, local_private)?;
                let eph = ciphertext.x25519_ephemeral.unwrap_or_default();
                let secret = derive_kem_secret(
                    domain::KEM_CLASSICAL,
                    &[&dh[..]],
                    &[&eph[..], &local_pub[..]],
                )?;
                Ok(SharedSecret(secret))
            }
            KemKind::Kyber768 | KemKind::Kyber1024 => {
                let level = KyberLevel::from_kem(algorithm.kem());
                let ct = kyber_ciphertext(ciphertext)?;
                let (pk, ss) = kyber_decapsulate(level, ct, local_private)?;
                let secret =
                    derive_kem_secret(domain::KEM_POST_QUANTUM, &[&ss[..]], &[ct, &pk[..]])?;
                Ok(SharedSecret(secret))
            }
            KemKind::X25519Kyber768 => {
                let (local_pub, dh) = x25519_decapsulate(ciphertext, local_private)?;
                let eph = ciphertext.x25519_ephemeral.unwrap_or_default();
                let ct = kyber_ciphertext(ciphertext)?;
                let (pk, ss) = kyber_decapsulate(KyberLevel::K768, ct, local_private)?;
                let secret = derive_kem_secret(
                    domain::KEM_HYBRID,
                    &[&dh[..], &ss[..]],
                    &[&eph[..], &local_pub[..], ct, &pk[..]],
                )?;
                Ok(SharedSecret(secret))
            }
        }
    }
}

fn generate_components(capabilities: &CapabilitySet) -> (PublicKeyBundle, PrivateKeyBundle) {
    let mut public = PublicKeyBundle::default();
    let mut private = PrivateKeyBundle::default();

    let needs = |kem: KemKind| capabilities.iter().any(|a| a.kem() == kem);
    let needs_x25519 = needs(KemKind::X25519) || needs(KemKind::X25519Kyber768);
    let needs_k768 = needs(KemKind::Kyber768) || needs(KemKind::X25519Kyber768);
    let needs_k1024 = needs(KemKind::Kyber1024);

    if needs_x25519 {
        let secret = StaticSecret::random_from_rng(OsRng);
        public.x25519 = Some(X25519PublicKey::from(&secret).to_bytes());
        private.x25519 = Some(secret.to_bytes());
    }
    if needs_k768 {
        let (pk, sk) = kyber768::keypair();
        public.kyber768 = Some(pk.as_bytes().to_vec());
        private.kyber768 = Some(sk.as_bytes().to_vec());
    }
    if needs_k1024 {
        let (pk, sk) = kyber1024::keypair();
        public.kyber1024 = Some(pk.as_bytes().to_vec());
        private.kyber1024 = Some(sk.as_bytes().to_vec());
    }

    (public, private)
}

fn x25519_encapsulate(peer: &X25519PublicKey) -> Result<([u8; 32], Zeroizing<[u8; 32]>)> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&ephemeral).to_bytes();
    let dh = ephemeral.diffie_hellman(peer);
    if !dh.was_contributory() {
        return Err(Error::InvalidKey("Peer X25519 key is a low-order point".into()));
    }
    Ok((eph_pub, Zeroizing::new(dh.to_bytes())))
}

fn x25519_decapsulate(
    ciphertext: &KemCiphertext,
    local_private: &PrivateKeyBundle,
) -> Result<([u8; 32], Zeroizing<[u8; 32]>)> {
    let eph = ciphertext
        .x25519_ephemeral
        .ok_or_else(|| Error::InvalidKey("Ciphertext has no X25519 ephemeral key".into()))?;
    let secret = local_private
        .x25519
        .map(StaticSecret::from)
        .ok_or_else(|| Error::InvalidKey("Local bundle has no X25519 private key".into()))?;
    let local_pub = X25519PublicKey::from(&secret).to_bytes();
    let dh = secret.diffie_hellman(&X25519PublicKey::from(eph));
    if !dh.was_contributory() {
        return Err(Error::InvalidKey("Ephemeral X25519 key is a low-order point".into()));
    }
    Ok((local_pub, Zeroizing::new(dh.to_bytes())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KyberLevel {
    K768,
    K1024,
}

impl KyberLevel {
    fn from_kem(kem: KemKind) -> Self {
        match kem {
            KemKind::Kyber1024 => KyberLevel::K1024,
            _ => KyberLevel::K768,
        }
    }

    fn public_key<'a>(&self, bundle: &'a PublicKeyBundle) -> Result<&'a [u8]> {
        let key = match self {
            KyberLevel::K768 => bundle.kyber768.as_deref(),
            KyberLevel::K1024 => bundle.kyber1024.as_deref(),
        };
        key.ok_or_else(|| Error::InvalidKey(format!("Bundle has no {:?} public key", self)))
    }

    fn secret_key<'a>(&self, bundle: &'a PrivateKeyBundle) -> Result<&'a [u8]> {
        let key = match self {
            KyberLevel::K768 => bundle.kyber768.as_deref(),
            KyberLevel::K1024 => bundle.kyber1024.as_deref(),
        };
        key.ok_or_else(|| Error::InvalidKey(format!("Local bundle has no {:?} private key", self)))
    }
}

fn kyber_ciphertext(ciphertext: &KemCiphertext) -> Result<&[u8]> {
    ciphertext
        .kyber
        .as_deref()
        .ok_or_else(|| Error::InvalidKey("Ciphertext has no Kyber component".into()))
}

fn kyber_encapsulate(level: KyberLevel, public: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
    let bad_key = |_| Error::InvalidKey(format!("Malformed {:?} public key", level));
    match level {
        KyberLevel::K768 => {
            let pk = kyber768::PublicKey::from_bytes(public).map_err(bad_key)?;
            let (ss, ct) = kyber768::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
        }
        KyberLevel::K1024 => {
            let pk = kyber1024::PublicKey::from_bytes(public).map_err(bad_key)?;
            let (ss, ct) = kyber1024::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
        }
    }
}

/// Returns the local Kyber public key (for the transcript) and the secret
fn kyber_decapsulate(
    level: KyberLevel,
    ciphertext: &[u8],
    local_private: &PrivateKeyBundle,
) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
    let secret = level.secret_key(local_private)?;
    let bad_ct = |_| Error::InvalidKey(format!("Malformed {:?} ciphertext", level));
    let bad_sk = |_| Error::InvalidKey(format!("Malformed {:?} private key", level));
    match level {
        KyberLevel::K768 => {
            let sk = kyber768::SecretKey::from_bytes(secret).map_err(bad_sk)?;
            let ct = kyber768::Ciphertext::from_bytes(ciphertext).map_err(bad_ct)?;
            let ss = kyber768::decapsulate(&ct, &sk);
            Ok((kyber_public_from_secret(secret, level), Zeroizing::new(ss.as_bytes().to_vec())))
        }
        KyberLevel::K1024 => {
            let sk = kyber1024::SecretKey::from_bytes(secret).map_err(bad_sk)?;
            let ct = kyber1024::Ciphertext::from_bytes(ciphertext).map_err(bad_ct)?;
            let ss = kyber1024::decapsulate(&ct, &sk);
            Ok((kyber_public_from_secret(secret, level), Zeroizing::new(ss.as_bytes().to_vec())))
        }
    }
}

/// Kyber secret keys embed the public key after the polynomial vector:
/// `sk = s || pk || H(pk) || z`.
fn kyber_public_from_secret(secret: &[u8], level: KyberLevel) -> Vec<u8> {
    let (offset, len) = match level {
        KyberLevel::K768 => (1152, kyber768::public_key_bytes()),
        KyberLevel::K1024 => (1536, kyber1024::public_key_bytes()),
    };
    secret
        .get(offset..offset + len)
        .map(|pk| pk.to_vec())
        .unwrap_or_default()
}

// ============================================================================
// DEVICE KEYS
// ============================================================================

/// Long-term keys of one device: an Ed25519 identity plus a KEM bundle
#[derive(ZeroizeOnDrop)]
pub struct DeviceKeys {
    #[zeroize(skip)]
    signing: SigningKeyPair,
    #[zeroize(skip)]
    kem_public: PublicKeyBundle,
    kem_private: PrivateKeyBundle,
}

/// Serialized form of [`DeviceKeys`] held inside the secure key store
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct StoredDeviceKeys {
    signing_secret: [u8; 32],
    #[zeroize(skip)]
    kem_public: PublicKeyBundle,
    kem_private: PrivateKeyBundle,
}

impl DeviceKeys {
    /// Generate keys able to receive every algorithm in `capabilities`
    pub fn generate(service: &KeyPairService, capabilities: &CapabilitySet) -> Result<Self> {
        let (kem_public, kem_private) = service.generate_bundle(capabilities)?;
        Ok(Self {
            signing: SigningKeyPair::generate(),
            kem_public,
            kem_private,
        })
    }

    pub fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub fn public_bundle(&self) -> &PublicKeyBundle {
        &self.kem_public
    }

    pub(crate) fn private_bundle(&self) -> &PrivateKeyBundle {
        &self.kem_private
    }

    /// Algorithms these keys can receive
    pub fn capabilities(&self) -> CapabilitySet {
        self.kem_public.capabilities()
    }

    pub(crate) fn to_stored(&self) -> StoredDeviceKeys {
        StoredDeviceKeys {
            signing_secret: *self.signing.secret_bytes(),
            kem_public: self.kem_public.clone(),
            kem_private: self.kem_private.clone(),
        }
    }

    pub(crate) fn from_stored(stored: &StoredDeviceKeys) -> Self {
        Self {
            signing: SigningKeyPair::from_bytes(&stored.signing_secret),
            kem_public: stored.kem_public.clone(),
            kem_private: stored.kem_private.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeys")
            .field("signing_public", &hex::encode(self.signing.public_bytes()))
            .field("capabilities", &self.capabilities().ids())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(algorithm: Algorithm) {
        let service = KeyPairService::new();
        let recipient = service.generate_key_pair(algorithm).unwrap();

        let (ciphertext, sender_secret) = service.encapsulate(&recipient.public, algorithm).unwrap();
        let recipient_secret = service
            .decapsulate(&ciphertext, &recipient.private, algorithm)
            .unwrap();

        assert_eq!(sender_secret.as_bytes(), recipient_secret.as_bytes());
    }

    #[test]
    fn test_classical_encapsulation() {
        round_trip(Algorithm::X25519Aes256Gcm);
    }

    #[test]
    fn test_post_quantum_encapsulation() {
        round_trip(Algorithm::Kyber768Aes256Gcm);
        round_trip(Algorithm::Kyber1024Aes256Gcm);
    }

    #[test]
    fn test_hybrid_encapsulation() {
        round_trip(Algorithm::X25519Kyber768ChaCha20Poly1305);
    }

    #[test]
    fn test_key_pair_components() {
        let service = KeyPairService::new();

        let classical = service.generate_key_pair(Algorithm::X25519Aes256Gcm).unwrap();
        assert!(classical.public.x25519.is_some());
        assert!(classical.public.kyber768.is_none());

        let hybrid = service.generate_key_pair(Algorithm::X25519Kyber768Aes256Gcm).unwrap();
        assert!(hybrid.public.x25519.is_some());
        assert_eq!(
            hybrid.public.kyber768.as_ref().map(|k| k.len()),
            Some(kyber768::public_key_bytes())
        );
    }

    #[test]
    fn test_wrong_recipient_gets_different_secret() {
        let service = KeyPairService::new();
        let algorithm = Algorithm::X25519Kyber768Aes256Gcm;
        let alice = service.generate_key_pair(algorithm).unwrap();
        let mallory = service.generate_key_pair(algorithm).unwrap();

        let (ciphertext, secret) = service.encapsulate(&alice.public, algorithm).unwrap();
        let stolen = service
            .decapsulate(&ciphertext, &mallory.private, algorithm)
            .unwrap();

        assert_ne!(secret.as_bytes(), stolen.as_bytes());
    }

    #[test]
    fn test_kyber_public_embedded_in_secret() {
        let (pk, sk) = kyber768::keypair();
        assert_eq!(
            kyber_public_from_secret(sk.as_bytes(), KyberLevel::K768),
            pk.as_bytes().to_vec()
        );
        let (pk, sk) = kyber1024::keypair();
        assert_eq!(
            kyber_public_from_secret(sk.as_bytes(), KyberLevel::K1024),
            pk.as_bytes().to_vec()
        );
    }

    #[test]
    fn test_disabled_algorithm_is_unsupported() {
        let service = KeyPairService::with_algorithms(CapabilitySet::new([Algorithm::X25519Aes256Gcm]));

        let err = service.generate_key_pair(Algorithm::Kyber768Aes256Gcm).err().unwrap();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));

        let peer = KeyPairService::new()
            .generate_key_pair(Algorithm::Kyber768Aes256Gcm)
            .unwrap();
        let err = service
            .encapsulate(&peer.public, Algorithm::Kyber768Aes256Gcm)
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_missing_component_is_invalid_key() {
        let service = KeyPairService::new();
        let classical = service.generate_key_pair(Algorithm::X25519Aes256Gcm).unwrap();
        let err = service
            .encapsulate(&classical.public, Algorithm::X25519Kyber768Aes256Gcm)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn test_device_keys_capabilities_and_storage() {
        let service = KeyPairService::new();
        let wanted = CapabilitySet::new([
            Algorithm::X25519Aes256Gcm,
            Algorithm::X25519Kyber768Aes256Gcm,
        ]);
        let keys = DeviceKeys::generate(&service, &wanted).unwrap();

        // X25519 + Kyber768 also covers the other constructions over those KEMs
        let caps = keys.capabilities();
        assert!(caps.contains(Algorithm::X25519ChaCha20Poly1305));
        assert!(caps.contains(Algorithm::Kyber768Aes256Gcm));
        assert!(!caps.contains(Algorithm::Kyber1024Aes256Gcm));

        let stored = keys.to_stored();
        let bytes = bincode::serialize(&stored).unwrap();
        let restored: StoredDeviceKeys = bincode::deserialize(&bytes).unwrap();
        let restored = DeviceKeys::from_stored(&restored);

        assert_eq!(restored.signing().public_bytes(), keys.signing().public_bytes());
        assert_eq!(restored.public_bundle(), keys.public_bundle());
    }

    #[test]
    fn test_private_bundle_debug_redacted() {
        let service = KeyPairService::new();
        let pair = service.generate_key_pair(Algorithm::X25519Aes256Gcm).unwrap();
        let debug = format!("{:?}", pair.private);
        assert!(debug.contains("redacted"));
    }
}
