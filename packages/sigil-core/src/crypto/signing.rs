//! # Digital Signatures
//!
//! Ed25519 signatures over envelope headers and negotiation records.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SIGNATURE USES                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  EncryptedEnvelope                                                     │
//! │    signature = Ed25519(sender device key,                              │
//! │                        header || nonce || ciphertext || tag || hash)   │
//! │    verified against the sender's *registered* signing key              │
//! │                                                                         │
//! │  Signed<Negotiation>                                                   │
//! │    signature = Ed25519(local device key, bincode(negotiation))         │
//! │    kept for audit and cache invalidation                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any verification failure maps to `IntegrityCheckFailed`.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::SigningKeyPair;
use crate::encoding::hex_array;
use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 digital signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_array")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

/// Sign a message with a device signing key
///
/// Ed25519 is deterministic: the same message and key give the same
/// signature.
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Signature {
    let sig = keypair.signing_key().sign(message);
    Signature(sig.to_bytes())
}

/// Verify an Ed25519 signature against a raw 32-byte public key
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::IntegrityCheckFailed(format!("Invalid signer key: {}", e)))?;

    let sig = Ed25519Signature::from_bytes(&signature.0);

    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| Error::IntegrityCheckFailed("Signature verification failed".into()))
}

// ============================================================================
// SIGNED DATA WRAPPER
// ============================================================================

/// A piece of data along with its signature over the bincode encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed<T: Serialize> {
    /// The signed data
    pub data: T,
    /// Public key of the signer
    #[serde(with = "hex_array")]
    pub signer_public_key: [u8; 32],
    /// Signature over the serialized data
    pub signature: Signature,
}

impl<T: Serialize> Signed<T> {
    pub fn new(data: T, keypair: &SigningKeyPair) -> Result<Self> {
        let serialized = bincode::serialize(&data)?;
        let signature = sign(keypair, &serialized);

        Ok(Self {
            data,
            signer_public_key: keypair.public_bytes(),
            signature,
        })
    }

    /// Verify the signature and return the data if valid
    pub fn verify(&self) -> Result<&T> {
        let serialized = bincode::serialize(&self.data)?;
        verify(&self.signer_public_key, &serialized, &self.signature)?;
        Ok(&self.data)
    }

    /// Verify and additionally require a specific signer
    pub fn verify_from(&self, expected_signer: &[u8; 32]) -> Result<&T> {
        if &self.signer_public_key != expected_signer {
            return Err(Error::IntegrityCheckFailed(
                "Record signed by an unexpected key".into(),
            ));
        }
        self.verify()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = SigningKeyPair::generate();
        let signature = sign(&keypair, b"header");
        assert!(verify(&keypair.public_bytes(), b"header", &signature).is_ok());
    }

    #[test]
    fn test_verify_failures_are_integrity_errors() {
        let keypair = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let signature = sign(&keypair, b"header");

        let err = verify(&keypair.public_bytes(), b"headex", &signature).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));

        let err = verify(&other.public_bytes(), b"header", &signature).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
    }

    #[test]
    fn test_signature_json_is_hex() {
        let keypair = SigningKeyPair::generate();
        let signature = sign(&keypair, b"test");

        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(json.len(), 2 + SIGNATURE_SIZE * 2);
        let restored: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(signature, restored);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        conversation: String,
        version: u32,
    }

    #[test]
    fn test_signed_wrapper() {
        let keypair = SigningKeyPair::generate();
        let record = Record {
            conversation: "conv-1".into(),
            version: 3,
        };

        let signed = Signed::new(record.clone(), &keypair).unwrap();
        assert_eq!(signed.verify().unwrap(), &record);
        assert!(signed.verify_from(&keypair.public_bytes()).is_ok());
        assert!(signed
            .verify_from(&SigningKeyPair::generate().public_bytes())
            .is_err());
    }

    #[test]
    fn test_signed_wrapper_tampered() {
        let keypair = SigningKeyPair::generate();
        let mut signed = Signed::new(
            Record {
                conversation: "conv-1".into(),
                version: 3,
            },
            &keypair,
        )
        .unwrap();

        signed.data.version = 2;
        assert!(signed.verify().is_err());
    }
}
