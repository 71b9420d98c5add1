//! Envelope wire format.
//!
//! ```json
//! {
//!   "format": "hybrid",
//!   "message_id": "…", "conversation_id": "conv-1",
//!   "sender_device_id": "…", "sender_user_id": "alice",
//!   "algorithm": "x25519-kyber768-aes256gcm",
//!   "key_version": 2, "message_number": 17, "previous_chain_length": 4,
//!   "nonce": "<base64>", "ciphertext": "<base64>", "tag": "<base64>",
//!   "content_hash": "<hex>", "compressed": false, "chunk": null,
//!   "signature": "<hex>", "signer_public_key": "<hex>", "timestamp": 1700000000000
//! }
//! ```
//!
//! `format` must agree with the algorithm's family. Everything except the
//! signature is covered by it; the header fields are also bound to the
//! ciphertext as associated data.

use serde::{Deserialize, Serialize};

use crate::crypto::{Algorithm, AlgorithmFamily, Signature, NONCE_SIZE, TAG_SIZE};
use crate::encoding::{base64_array, base64_bytes, hex_array};
use crate::error::{Error, Result};
use crate::ratchet::RatchetHeader;

const SIGNATURE_DOMAIN: &[u8] = b"sigil-envelope-v1";

/// Position of an envelope within a chunked message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLink {
    pub group_id: String,
    pub index: u32,
    pub total: u32,
}

/// An encrypted message, or one chunk of one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_device_id: String,
    pub sender_user_id: String,
    pub algorithm: Algorithm,
    pub key_version: u32,
    pub message_number: u32,
    pub previous_chain_length: u32,
    #[serde(with = "base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_array")]
    pub tag: [u8; TAG_SIZE],
    /// Keyed hash of the plaintext
    #[serde(with = "hex_array")]
    pub content_hash: [u8; 32],
    pub compressed: bool,
    pub chunk: Option<ChunkLink>,
    pub signature: Signature,
    #[serde(with = "hex_array")]
    pub signer_public_key: [u8; 32],
    /// Unix milliseconds
    pub timestamp: i64,
}

#[derive(Serialize)]
struct HeaderAad<'a> {
    message_id: &'a str,
    conversation_id: &'a str,
    sender_device_id: &'a str,
    sender_user_id: &'a str,
    algorithm: &'a str,
    key_version: u32,
    message_number: u32,
    previous_chain_length: u32,
    compressed: bool,
    chunk: Option<&'a ChunkLink>,
    timestamp: i64,
}

impl EncryptedEnvelope {
    /// Ratchet position the sender used
    pub fn ratchet_header(&self) -> RatchetHeader {
        RatchetHeader {
            sender_device_id: self.sender_device_id.clone(),
            key_version: self.key_version,
            message_number: self.message_number,
            previous_chain_length: self.previous_chain_length,
        }
    }

    /// Header fields bound to the ciphertext
    pub(crate) fn associated_data(&self) -> Result<Vec<u8>> {
        let aad = HeaderAad {
            message_id: &self.message_id,
            conversation_id: &self.conversation_id,
            sender_device_id: &self.sender_device_id,
            sender_user_id: &self.sender_user_id,
            algorithm: self.algorithm.id(),
            key_version: self.key_version,
            message_number: self.message_number,
            previous_chain_length: self.previous_chain_length,
            compressed: self.compressed,
            chunk: self.chunk.as_ref(),
            timestamp: self.timestamp,
        };
        Ok(bincode::serialize(&aad)?)
    }

    /// Bytes the sender signs
    pub(crate) fn signed_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = SIGNATURE_DOMAIN.to_vec();
        bytes.extend_from_slice(&self.associated_data()?);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&(self.ciphertext.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.tag);
        bytes.extend_from_slice(&self.content_hash);
        Ok(bytes)
    }
}

/// An envelope as exchanged with the host, tagged by construction family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Envelope {
    Classical(EncryptedEnvelope),
    Hybrid(EncryptedEnvelope),
    PostQuantum(EncryptedEnvelope),
    /// Payload from a client that never encrypted; always rejected
    LegacyFallback { payload: String },
}

impl Envelope {
    /// Tag an envelope with the variant its algorithm requires
    pub fn wrap(envelope: EncryptedEnvelope) -> Self {
        match envelope.algorithm.family() {
            AlgorithmFamily::Classical => Envelope::Classical(envelope),
            AlgorithmFamily::Hybrid => Envelope::Hybrid(envelope),
            AlgorithmFamily::PostQuantum => Envelope::PostQuantum(envelope),
        }
    }

    /// Decode and validate a wire envelope
    ///
    /// ## Errors
    ///
    /// - `UnsupportedAlgorithm` for an unknown algorithm id
    /// - `IntegrityCheckFailed` if the format disagrees with the algorithm
    ///   or the document is malformed
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::IntegrityCheckFailed(format!("Malformed envelope: {}", e)))?;
        if let Some(id) = value.get("algorithm").and_then(|a| a.as_str()) {
            Algorithm::from_id(id)?;
        }

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::IntegrityCheckFailed(format!("Malformed envelope: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The encrypted payload, `None` for a legacy fallback
    pub fn inner(&self) -> Option<&EncryptedEnvelope> {
        match self {
            Envelope::Classical(e) | Envelope::Hybrid(e) | Envelope::PostQuantum(e) => Some(e),
            Envelope::LegacyFallback { .. } => None,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.inner().map(|e| e.message_id.as_str())
    }

    pub fn chunk(&self) -> Option<&ChunkLink> {
        self.inner().and_then(|e| e.chunk.as_ref())
    }

    /// Check that the variant matches the algorithm family
    pub fn validate(&self) -> Result<()> {
        let (declared, envelope) = match self {
            Envelope::Classical(e) => (AlgorithmFamily::Classical, e),
            Envelope::Hybrid(e) => (AlgorithmFamily::Hybrid, e),
            Envelope::PostQuantum(e) => (AlgorithmFamily::PostQuantum, e),
            Envelope::LegacyFallback { .. } => return Ok(()),
        };
        if envelope.algorithm.family() != declared {
            return Err(Error::IntegrityCheckFailed(format!(
                "Envelope tagged {} carries {}",
                declared, envelope.algorithm
            )));
        }
        Ok(())
    }
}
