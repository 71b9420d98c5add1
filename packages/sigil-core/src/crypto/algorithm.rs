//! # Algorithm Catalogue
//!
//! Every encryption construction a device can advertise.
//!
//! | Id | Family | KEM | AEAD | Level |
//! |----|--------|-----|------|-------|
//! | `x25519-aes256gcm` | classical | X25519 | AES-256-GCM | 128 |
//! | `x25519-chacha20poly1305` | classical | X25519 | ChaCha20-Poly1305 | 128 |
//! | `kyber768-aes256gcm` | post-quantum | Kyber768 | AES-256-GCM | 192 |
//! | `kyber1024-aes256gcm` | post-quantum | Kyber1024 | AES-256-GCM | 256 |
//! | `x25519-kyber768-aes256gcm` | hybrid | X25519 + Kyber768 | AES-256-GCM | 192 |
//! | `x25519-kyber768-chacha20poly1305` | hybrid | X25519 + Kyber768 | ChaCha20-Poly1305 | 192 |
//!
//! Families are ordered `Classical < PostQuantum < Hybrid`; the negotiator
//! prefers the highest family first, then the highest security level.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Broad class of a construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmFamily {
    /// Elliptic-curve key exchange only
    Classical,
    /// Lattice KEM only
    PostQuantum,
    /// Classical and post-quantum secrets combined
    Hybrid,
}

impl fmt::Display for AlgorithmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlgorithmFamily::Classical => "classical",
            AlgorithmFamily::PostQuantum => "post-quantum",
            AlgorithmFamily::Hybrid => "hybrid",
        })
    }
}

/// Authenticated cipher used for payloads and wrapped keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AeadCipher {
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Key encapsulation component of a construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KemKind {
    X25519,
    Kyber768,
    Kyber1024,
    X25519Kyber768,
}

/// A supported encryption construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    X25519Aes256Gcm,
    X25519ChaCha20Poly1305,
    Kyber768Aes256Gcm,
    Kyber1024Aes256Gcm,
    X25519Kyber768Aes256Gcm,
    X25519Kyber768ChaCha20Poly1305,
}

impl Algorithm {
    /// Every algorithm this build knows about
    pub const ALL: [Algorithm; 6] = [
        Algorithm::X25519Aes256Gcm,
        Algorithm::X25519ChaCha20Poly1305,
        Algorithm::Kyber768Aes256Gcm,
        Algorithm::Kyber1024Aes256Gcm,
        Algorithm::X25519Kyber768Aes256Gcm,
        Algorithm::X25519Kyber768ChaCha20Poly1305,
    ];

    /// Stable wire identifier
    pub fn id(&self) -> &'static str {
        match self {
            Algorithm::X25519Aes256Gcm => "x25519-aes256gcm",
            Algorithm::X25519ChaCha20Poly1305 => "x25519-chacha20poly1305",
            Algorithm::Kyber768Aes256Gcm => "kyber768-aes256gcm",
            Algorithm::Kyber1024Aes256Gcm => "kyber1024-aes256gcm",
            Algorithm::X25519Kyber768Aes256Gcm => "x25519-kyber768-aes256gcm",
            Algorithm::X25519Kyber768ChaCha20Poly1305 => "x25519-kyber768-chacha20poly1305",
        }
    }

    pub fn family(&self) -> AlgorithmFamily {
        match self.kem() {
            KemKind::X25519 => AlgorithmFamily::Classical,
            KemKind::Kyber768 | KemKind::Kyber1024 => AlgorithmFamily::PostQuantum,
            KemKind::X25519Kyber768 => AlgorithmFamily::Hybrid,
        }
    }

    pub fn kem(&self) -> KemKind {
        match self {
            Algorithm::X25519Aes256Gcm | Algorithm::X25519ChaCha20Poly1305 => KemKind::X25519,
            Algorithm::Kyber768Aes256Gcm => KemKind::Kyber768,
            Algorithm::Kyber1024Aes256Gcm => KemKind::Kyber1024,
            Algorithm::X25519Kyber768Aes256Gcm | Algorithm::X25519Kyber768ChaCha20Poly1305 => {
                KemKind::X25519Kyber768
            }
        }
    }

    pub fn aead(&self) -> AeadCipher {
        match self {
            Algorithm::X25519ChaCha20Poly1305 | Algorithm::X25519Kyber768ChaCha20Poly1305 => {
                AeadCipher::ChaCha20Poly1305
            }
            _ => AeadCipher::Aes256Gcm,
        }
    }

    /// Declared security level in bits
    pub fn security_level(&self) -> u16 {
        match self {
            Algorithm::X25519Aes256Gcm | Algorithm::X25519ChaCha20Poly1305 => 128,
            Algorithm::Kyber768Aes256Gcm
            | Algorithm::X25519Kyber768Aes256Gcm
            | Algorithm::X25519Kyber768ChaCha20Poly1305 => 192,
            Algorithm::Kyber1024Aes256Gcm => 256,
        }
    }

    /// Parse a wire identifier
    pub fn from_id(id: &str) -> Result<Self> {
        Algorithm::ALL
            .iter()
            .copied()
            .find(|a| a.id() == id)
            .ok_or_else(|| Error::UnsupportedAlgorithm(id.to_string()))
    }

    /// Preference ordering: family, then level, then the lexicographically
    /// first id. `Greater` means more preferred.
    pub fn preference_cmp(&self, other: &Algorithm) -> std::cmp::Ordering {
        self.family()
            .cmp(&other.family())
            .then(self.security_level().cmp(&other.security_level()))
            .then_with(|| other.id().cmp(self.id()))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::from_id(s)
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let id = String::deserialize(deserializer)?;
        Algorithm::from_id(&id).map_err(serde::de::Error::custom)
    }
}

/// The algorithms a device declares it can decrypt
///
/// Backed by an ordered set, so two equal sets always serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Algorithm>);

impl CapabilitySet {
    pub fn new<I: IntoIterator<Item = Algorithm>>(algorithms: I) -> Self {
        Self(algorithms.into_iter().collect())
    }

    /// Parse a list of wire ids; any unknown id fails the whole set
    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Result<Self> {
        ids.iter()
            .map(|id| Algorithm::from_id(id.as_ref()))
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    pub fn all() -> Self {
        Self::new(Algorithm::ALL)
    }

    pub fn contains(&self, algorithm: Algorithm) -> bool {
        self.0.contains(&algorithm)
    }

    pub fn insert(&mut self, algorithm: Algorithm) {
        self.0.insert(algorithm);
    }

    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Algorithm> + '_ {
        self.0.iter().copied()
    }

    /// Most preferred algorithm in the set
    pub fn best(&self) -> Option<Algorithm> {
        self.0.iter().copied().max_by(|a, b| a.preference_cmp(b))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.0.iter().map(|a| a.id()).collect();
        ids.sort_unstable();
        ids
    }
}

impl FromIterator<Algorithm> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Algorithm>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_parse_back() {
        for algorithm in Algorithm::ALL {
            assert_eq!(Algorithm::from_id(algorithm.id()).unwrap(), algorithm);
        }
    }

    #[test]
    fn test_unknown_id_is_unsupported() {
        let err = Algorithm::from_id("rot13-base64").unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));

        let err = CapabilitySet::from_ids(&["x25519-aes256gcm", "legacy-obfuscation"]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_family_order() {
        assert!(AlgorithmFamily::Classical < AlgorithmFamily::PostQuantum);
        assert!(AlgorithmFamily::PostQuantum < AlgorithmFamily::Hybrid);
    }

    #[test]
    fn test_best_prefers_family_then_level_then_id() {
        // Hybrid beats a higher-level pure PQ construction
        let set = CapabilitySet::new([Algorithm::Kyber1024Aes256Gcm, Algorithm::X25519Kyber768Aes256Gcm]);
        assert_eq!(set.best(), Some(Algorithm::X25519Kyber768Aes256Gcm));

        // Same family: higher level wins
        let set = CapabilitySet::new([Algorithm::Kyber768Aes256Gcm, Algorithm::Kyber1024Aes256Gcm]);
        assert_eq!(set.best(), Some(Algorithm::Kyber1024Aes256Gcm));

        // Exact tie: lexicographically first id wins
        let set = CapabilitySet::new([Algorithm::X25519ChaCha20Poly1305, Algorithm::X25519Aes256Gcm]);
        assert_eq!(set.best(), Some(Algorithm::X25519Aes256Gcm));

        assert_eq!(CapabilitySet::default().best(), None);
    }

    #[test]
    fn test_serializes_as_id() {
        let json = serde_json::to_string(&Algorithm::Kyber768Aes256Gcm).unwrap();
        assert_eq!(json, "\"kyber768-aes256gcm\"");
        assert!(serde_json::from_str::<Algorithm>("\"des-cbc\"").is_err());
    }
}
