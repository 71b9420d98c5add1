//! # Encryption Codec
//!
//! Turns plaintext into signed envelopes and back.
//!
//! ## Encrypt
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ENCRYPT PATH                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  plaintext ──► > chunk_size? ──► split into linked chunks               │
//! │                                                                         │
//! │  per chunk:                                                             │
//! │    conversation key (cache / directory) ──► ratchet ──► message key     │
//! │    content hash = HMAC(hash key(message key), plaintext)                │
//! │    body = deflate(plaintext) if > threshold and smaller                 │
//! │    AEAD(message key, body, aad = header)                                │
//! │    Ed25519 signature by the sending device                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decrypt
//!
//! Checks run in order and the first failure aborts. No plaintext is
//! returned unless every check passed.
//!
//! 1. Format is not a legacy fallback, algorithm is one this device declared
//! 2. Sender is a registered, non-revoked device whose key signed the envelope
//! 3. Conversation key for the envelope's version, ratchet message key
//! 4. AEAD tag
//! 5. Content hash

mod envelope;

pub use envelope::{ChunkLink, EncryptedEnvelope, Envelope};

use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::cache::{OperationKind, OperationSample, PerformanceOptimizer};
use crate::config::CodecConfig;
use crate::conversation::{ConversationKeyManager, ConversationSecret};
use crate::crypto::kdf::derive_content_hash_key;
use crate::crypto::{decrypt, encrypt, sign, verify, CapabilitySet, EncryptionKey, Nonce, Signature};
use crate::device::DeviceRegistry;
use crate::error::{Error, Result};
use crate::ratchet::{MessageKey, RatchetEngine};
use crate::storage::SecureKeyStore;

type HmacSha256 = Hmac<Sha256>;

/// Deflate level for compressed bodies
const COMPRESSION_LEVEL: u8 = 6;

fn hash_mac(message_key: &MessageKey) -> Result<HmacSha256> {
    let hash_key = derive_content_hash_key(message_key.as_bytes())?;
    HmacSha256::new_from_slice(&hash_key[..])
        .map_err(|e| Error::KeyDerivationFailed(format!("HMAC init failed: {}", e)))
}

fn content_hash(message_key: &MessageKey, plaintext: &[u8]) -> Result<[u8; 32]> {
    let mut mac = hash_mac(message_key)?;
    mac.update(plaintext);
    Ok(mac.finalize().into_bytes().into())
}

/// Envelope encryption for the local device
pub struct EncryptionCodec {
    user_id: String,
    device_id: String,
    capabilities: CapabilitySet,
    key_store: SecureKeyStore,
    keys: Arc<ConversationKeyManager>,
    ratchet: Arc<RatchetEngine>,
    registry: Arc<DeviceRegistry>,
    optimizer: Arc<PerformanceOptimizer>,
    config: CodecConfig,
}

impl EncryptionCodec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        capabilities: CapabilitySet,
        key_store: SecureKeyStore,
        keys: Arc<ConversationKeyManager>,
        ratchet: Arc<RatchetEngine>,
        registry: Arc<DeviceRegistry>,
        optimizer: Arc<PerformanceOptimizer>,
        config: CodecConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            capabilities,
            key_store,
            keys,
            ratchet,
            registry,
            optimizer,
            config,
        }
    }

    /// Algorithms this device accepts
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    // ========================================================================
    // ENCRYPT
    // ========================================================================

    /// Encrypt a payload into a single envelope
    pub async fn encrypt(&self, plaintext: &[u8], conversation_id: &str) -> Result<Envelope> {
        self.check_size(plaintext)?;
        let secret = self.current_key(conversation_id).await?;
        self.seal(&secret, plaintext, None)
    }

    /// Encrypt a payload, chunking it when it exceeds `chunk_size`
    pub async fn encrypt_message(&self, plaintext: &[u8], conversation_id: &str) -> Result<Vec<Envelope>> {
        self.check_size(plaintext)?;
        let secret = self.current_key(conversation_id).await?;

        if plaintext.len() <= self.config.chunk_size {
            return Ok(vec![self.seal(&secret, plaintext, None)?]);
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        let total = plaintext.chunks(self.config.chunk_size).count() as u32;
        let envelopes = plaintext
            .chunks(self.config.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let link = ChunkLink {
                    group_id: group_id.clone(),
                    index: index as u32,
                    total,
                };
                self.seal(&secret, chunk, Some(link))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            conversation = conversation_id,
            chunks = total,
            bytes = plaintext.len(),
            "Encrypted chunked message"
        );
        Ok(envelopes)
    }

    /// Encrypt many payloads with one key fetch
    ///
    /// Work proceeds in groups of the tuned batch size, yielding to the
    /// runtime between groups.
    pub async fn encrypt_batch<P: AsRef<[u8]>>(
        &self,
        plaintexts: &[P],
        conversation_id: &str,
    ) -> Result<Vec<Envelope>> {
        for plaintext in plaintexts {
            self.check_size(plaintext.as_ref())?;
        }
        let secret = self.current_key(conversation_id).await?;
        let batch_size = self.optimizer.cache().tuning().batch_size.max(1);

        let mut envelopes = Vec::with_capacity(plaintexts.len());
        for batch in plaintexts.chunks(batch_size) {
            for plaintext in batch {
                envelopes.push(self.seal(&secret, plaintext.as_ref(), None)?);
            }
            tokio::task::yield_now().await;
        }
        Ok(envelopes)
    }

    fn check_size(&self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > self.config.max_message_size {
            return Err(Error::InvalidMessage(format!(
                "Payload of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                self.config.max_message_size
            )));
        }
        Ok(())
    }

    async fn current_key(&self, conversation_id: &str) -> Result<ConversationSecret> {
        let started = Instant::now();
        let result = self.keys.fetch_or_unwrap(conversation_id).await;
        self.optimizer.record(OperationSample::new(
            OperationKind::KeyFetch,
            started.elapsed(),
            result.is_ok(),
        ));
        let secret = result?;
        self.ensure_ratchet(&secret)?;
        Ok(secret)
    }

    fn ensure_ratchet(&self, secret: &ConversationSecret) -> Result<()> {
        if !self.ratchet.is_initialized(&secret.conversation_id, secret.version) {
            self.ratchet
                .initialize(&secret.conversation_id, secret.version, secret.key())?;
        }
        Ok(())
    }

    fn seal(&self, secret: &ConversationSecret, plaintext: &[u8], chunk: Option<ChunkLink>) -> Result<Envelope> {
        let started = Instant::now();
        let (message_key, header) = self.ratchet.derive_send_key(&secret.conversation_id)?;
        if header.key_version != secret.version {
            return Err(Error::RatchetStateCorrupted(format!(
                "Ratchet sends at version {} but the key is version {}",
                header.key_version, secret.version
            )));
        }

        let threshold = self.optimizer.cache().tuning().compression_threshold;
        let mut body = None;
        if plaintext.len() >= threshold {
            let deflated = miniz_oxide::deflate::compress_to_vec(plaintext, COMPRESSION_LEVEL);
            if deflated.len() < plaintext.len() {
                body = Some(deflated);
            }
        }
        let compressed = body.is_some();
        let body = body.unwrap_or_else(|| plaintext.to_vec());

        let mut envelope = EncryptedEnvelope {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: secret.conversation_id.clone(),
            sender_device_id: self.device_id.clone(),
            sender_user_id: self.user_id.clone(),
            algorithm: secret.algorithm,
            key_version: header.key_version,
            message_number: header.message_number,
            previous_chain_length: header.previous_chain_length,
            nonce: [0u8; crate::crypto::NONCE_SIZE],
            ciphertext: Vec::new(),
            tag: [0u8; crate::crypto::TAG_SIZE],
            content_hash: content_hash(&message_key, plaintext)?,
            compressed,
            chunk,
            signature: Signature::from_bytes([0u8; crate::crypto::SIGNATURE_SIZE]),
            signer_public_key: [0u8; 32],
            timestamp: crate::time::now_timestamp_millis(),
        };

        let aad = envelope.associated_data()?;
        let sealed = encrypt(
            secret.algorithm.aead(),
            &EncryptionKey::from_bytes(*message_key.as_bytes()),
            &body,
            &aad,
        )?;
        drop(message_key);

        envelope.nonce = sealed.nonce.0;
        envelope.ciphertext = sealed.ciphertext;
        envelope.tag = sealed.tag;

        let signed = envelope.signed_bytes()?;
        let (signature, signer) = self.key_store.with_private_key(&self.user_id, |keys| {
            Ok((sign(keys.signing(), &signed), keys.signing().public_bytes()))
        })?;
        envelope.signature = signature;
        envelope.signer_public_key = signer;

        self.optimizer.record(
            OperationSample::new(OperationKind::Encrypt, started.elapsed(), true)
                .with_compression(plaintext.len(), body.len()),
        );
        Ok(Envelope::wrap(envelope))
    }

    // ========================================================================
    // DECRYPT
    // ========================================================================

    /// Decrypt one envelope
    pub async fn decrypt(&self, envelope: &Envelope, conversation_id: &str) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.open(envelope, conversation_id).await;
        self.optimizer.record(OperationSample::new(
            OperationKind::Decrypt,
            started.elapsed(),
            result.is_ok(),
        ));
        if let Err(e) = &result {
            tracing::warn!(
                conversation = conversation_id,
                message = ?envelope.message_id(),
                "Decryption failed: {}",
                e
            );
        }
        result
    }

    /// Decrypt a message that may span several chunk envelopes
    ///
    /// Chunks may arrive in any order; a missing, duplicate or foreign chunk
    /// fails the whole message.
    pub async fn decrypt_message(&self, envelopes: &[Envelope], conversation_id: &str) -> Result<Vec<u8>> {
        match envelopes {
            [] => Err(Error::InvalidMessage("No envelopes".into())),
            [single] if single.chunk().is_none() => self.decrypt(single, conversation_id).await,
            _ => {
                let mut ordered: Vec<(&ChunkLink, &Envelope)> = Vec::with_capacity(envelopes.len());
                for envelope in envelopes {
                    let link = envelope.chunk().ok_or_else(|| {
                        Error::IntegrityCheckFailed("Unchunked envelope in a chunked message".into())
                    })?;
                    ordered.push((link, envelope));
                }
                ordered.sort_by_key(|(link, _)| link.index);

                let (first, _) = ordered[0];
                let complete = first.total as usize == ordered.len()
                    && ordered.iter().enumerate().all(|(i, (link, _))| {
                        link.group_id == first.group_id
                            && link.total == first.total
                            && link.index as usize == i
                    });
                if !complete {
                    return Err(Error::IntegrityCheckFailed(
                        "Chunk set is incomplete or mixed".into(),
                    ));
                }

                let mut plaintext = Vec::new();
                for (_, envelope) in ordered {
                    plaintext.extend_from_slice(&self.decrypt(envelope, conversation_id).await?);
                }
                Ok(plaintext)
            }
        }
    }

    async fn open(&self, envelope: &Envelope, conversation_id: &str) -> Result<Vec<u8>> {
        let inner = envelope.inner().ok_or_else(|| {
            Error::UnsupportedAlgorithm("Legacy fallback envelopes are not accepted".into())
        })?;
        envelope.validate()?;

        if inner.conversation_id != conversation_id {
            return Err(Error::IntegrityCheckFailed(format!(
                "Envelope belongs to conversation {}",
                inner.conversation_id
            )));
        }
        if !self.capabilities.contains(inner.algorithm) {
            return Err(Error::UnsupportedAlgorithm(format!(
                "{} is not accepted by this device",
                inner.algorithm
            )));
        }

        let sender = self
            .registry
            .get(&inner.sender_device_id)
            .ok_or_else(|| Error::DeviceNotFound(inner.sender_device_id.clone()))?;
        if sender.is_revoked() {
            return Err(Error::DeviceRevoked(sender.id));
        }
        if sender.signing_public_key != inner.signer_public_key {
            return Err(Error::IntegrityCheckFailed(format!(
                "Envelope was not signed by device {}",
                sender.id
            )));
        }
        verify(&inner.signer_public_key, &inner.signed_bytes()?, &inner.signature)?;

        let secret = self.key_for(conversation_id, inner.key_version).await?;
        if secret.algorithm != inner.algorithm {
            return Err(Error::IntegrityCheckFailed(format!(
                "Key version {} uses {}, envelope claims {}",
                inner.key_version, secret.algorithm, inner.algorithm
            )));
        }
        self.ensure_ratchet(&secret)?;
        let message_key = self
            .ratchet
            .derive_receive_key(conversation_id, &inner.ratchet_header())?;

        let body = decrypt(
            inner.algorithm.aead(),
            &EncryptionKey::from_bytes(*message_key.as_bytes()),
            &Nonce(inner.nonce),
            &inner.ciphertext,
            &inner.tag,
            &inner.associated_data()?,
        )?;

        let plaintext = if inner.compressed {
            miniz_oxide::inflate::decompress_to_vec_with_limit(&body, self.config.max_message_size)
                .map_err(|_| Error::IntegrityCheckFailed("Compressed body is invalid".into()))?
        } else {
            body
        };

        let mut mac = hash_mac(&message_key)?;
        mac.update(&plaintext);
        mac.verify_slice(&inner.content_hash)
            .map_err(|_| Error::IntegrityCheckFailed("Content hash mismatch".into()))?;

        if let Err(e) = self.registry.touch(&sender.id) {
            tracing::debug!(device = %sender.id, "Could not record sender activity: {}", e);
        }
        Ok(plaintext)
    }

    async fn key_for(&self, conversation_id: &str, version: u32) -> Result<ConversationSecret> {
        let newer = self
            .keys
            .current_version(conversation_id)
            .map_or(true, |current| version > current);
        if newer {
            let secret = self.keys.fetch_or_unwrap(conversation_id).await?;
            if secret.version == version {
                return Ok(secret);
            }
        }
        self.keys.historical_key(conversation_id, version).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::config::SigilConfig;
    use crate::conversation::MemoryDirectory;
    use crate::crypto::{Algorithm, DeviceKeys, KeyPairService};
    use crate::device::{DeviceKind, DeviceRegistration};
    use crate::events::SecurityEventLog;

    const CONV: &str = "notes";

    struct Fixture {
        codec: EncryptionCodec,
        parts: (SecureKeyStore, Arc<ConversationKeyManager>, Arc<RatchetEngine>, Arc<DeviceRegistry>, Arc<PerformanceOptimizer>),
    }

    impl Fixture {
        fn with_capabilities(&self, capabilities: CapabilitySet) -> EncryptionCodec {
            let (store, keys, ratchet, registry, optimizer) = self.parts.clone();
            EncryptionCodec::new(
                "alice",
                "alice-laptop",
                capabilities,
                store,
                keys,
                ratchet,
                registry,
                optimizer,
                CodecConfig::default(),
            )
        }
    }

    /// A single device writing notes to itself
    async fn fixture(codec_config: CodecConfig) -> Fixture {
        let config = SigilConfig::fast_kdf();
        let keys = DeviceKeys::generate(&KeyPairService::new(), &CapabilitySet::all()).unwrap();
        let store = SecureKeyStore::in_memory(config.backup.clone());
        store.store_private_key("alice", &keys).unwrap();

        let registry = Arc::new(DeviceRegistry::new("alice"));
        registry
            .register(DeviceRegistration {
                device_id: Some("alice-laptop".into()),
                user_id: "alice".into(),
                name: "Laptop".into(),
                kind: DeviceKind::Desktop,
                signing_public_key: keys.signing().public_bytes(),
                public_keys: keys.public_bundle().clone(),
                capabilities: keys.capabilities(),
                hardware_attributes: None,
            })
            .unwrap();

        let events = SecurityEventLog::new();
        let cache = Arc::new(KeyCache::from_config(&config.cache));
        let manager = Arc::new(ConversationKeyManager::new(
            "alice",
            "alice-laptop",
            store.clone(),
            registry.clone(),
            Arc::new(MemoryDirectory::new()),
            cache.clone(),
            events.clone(),
            &config,
        ));
        let ratchet = Arc::new(RatchetEngine::new("alice-laptop", config.ratchet.clone(), events));
        let optimizer = Arc::new(PerformanceOptimizer::new(cache, config.cache.clone()));

        manager
            .setup_conversation(CONV, &["alice-laptop".to_string()], None)
            .await
            .unwrap();

        let codec = EncryptionCodec::new(
            "alice",
            "alice-laptop",
            keys.capabilities(),
            store.clone(),
            manager.clone(),
            ratchet.clone(),
            registry.clone(),
            optimizer.clone(),
            codec_config,
        );
        Fixture {
            codec,
            parts: (store, manager, ratchet, registry, optimizer),
        }
    }

    fn inner_mut(envelope: &mut Envelope) -> &mut EncryptedEnvelope {
        match envelope {
            Envelope::Classical(e) | Envelope::Hybrid(e) | Envelope::PostQuantum(e) => e,
            Envelope::LegacyFallback { .. } => panic!("legacy envelope"),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let f = fixture(CodecConfig::default()).await;
        let envelope = f.codec.encrypt(b"hello", CONV).await.unwrap();
        assert!(matches!(envelope, Envelope::Hybrid(_)));
        assert_eq!(f.codec.decrypt(&envelope, CONV).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_large_payload_is_compressed() {
        let f = fixture(CodecConfig::default()).await;
        let text = "the same line again\n".repeat(500);
        let envelope = f.codec.encrypt(text.as_bytes(), CONV).await.unwrap();

        let inner = envelope.inner().unwrap();
        assert!(inner.compressed);
        assert!(inner.ciphertext.len() < text.len());
        assert_eq!(f.codec.decrypt(&envelope, CONV).await.unwrap(), text.as_bytes());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected() {
        let f = fixture(CodecConfig::default()).await;
        let mut envelope = f.codec.encrypt(b"hello", CONV).await.unwrap();
        inner_mut(&mut envelope).ciphertext[0] ^= 0x01;

        let err = f.codec.decrypt(&envelope, CONV).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
    }

    #[tokio::test]
    async fn test_tampered_header_rejected() {
        let f = fixture(CodecConfig::default()).await;
        let mut envelope = f.codec.encrypt(b"hello", CONV).await.unwrap();
        inner_mut(&mut envelope).message_number += 1;

        let err = f.codec.decrypt(&envelope, CONV).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IntegrityCheckFailed);
    }

    #[tokio::test]
    async fn test_chunked_message_any_order() {
        let f = fixture(CodecConfig {
            chunk_size: 16,
            ..CodecConfig::default()
        })
        .await;
        let payload: Vec<u8> = (0..100u8).collect();

        let mut envelopes = f.codec.encrypt_message(&payload, CONV).await.unwrap();
        assert_eq!(envelopes.len(), 7);
        envelopes.reverse();
        assert_eq!(f.codec.decrypt_message(&envelopes, CONV).await.unwrap(), payload);

        envelopes.pop();
        let err = f.codec.decrypt_message(&envelopes, CONV).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
    }

    #[tokio::test]
    async fn test_batch_encrypt() {
        let f = fixture(CodecConfig::default()).await;
        let payloads: Vec<String> = (0..40).map(|i| format!("message {}", i)).collect();

        let envelopes = f.codec.encrypt_batch(&payloads, CONV).await.unwrap();
        assert_eq!(envelopes.len(), 40);
        for (payload, envelope) in payloads.iter().zip(&envelopes) {
            assert_eq!(f.codec.decrypt(envelope, CONV).await.unwrap(), payload.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_legacy_fallback_rejected() {
        let f = fixture(CodecConfig::default()).await;
        let legacy = Envelope::from_json(r#"{"format":"legacy_fallback","payload":"aGVsbG8="}"#).unwrap();
        let err = f.codec.decrypt(&legacy, CONV).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[tokio::test]
    async fn test_undeclared_algorithm_rejected() {
        let f = fixture(CodecConfig::default()).await;
        let envelope = f.codec.encrypt(b"hello", CONV).await.unwrap();

        let classical_only = f.with_capabilities(CapabilitySet::new([Algorithm::X25519Aes256Gcm]));
        let err = classical_only.decrypt(&envelope, CONV).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[tokio::test]
    async fn test_wire_round_trip_and_format_checks() {
        let f = fixture(CodecConfig::default()).await;
        let envelope = f.codec.encrypt(b"over the wire", CONV).await.unwrap();
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""format":"hybrid""#));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(f.codec.decrypt(&parsed, CONV).await.unwrap(), b"over the wire");

        let relabeled = json.replace(r#""format":"hybrid""#, r#""format":"classical""#);
        assert!(matches!(
            Envelope::from_json(&relabeled),
            Err(Error::IntegrityCheckFailed(_))
        ));

        let unknown = json.replace("x25519-kyber768-aes256gcm", "rot13-xor");
        assert!(matches!(
            Envelope::from_json(&unknown),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let f = fixture(CodecConfig {
            max_message_size: 8,
            ..CodecConfig::default()
        })
        .await;
        let err = f.codec.encrypt(b"far too long", CONV).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }
}
