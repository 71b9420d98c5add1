//! # Algorithm Negotiation
//!
//! Picks the construction a conversation is encrypted with.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        NEGOTIATION                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  participants ──► drop suspended / revoked ──► intersect capabilities   │
//! │                                                      │                  │
//! │                         ┌────────────────────────────┤                  │
//! │                         ▼                            ▼                  │
//! │                  non-empty, best ≥ policy     empty, or best < policy   │
//! │                         │                            │                  │
//! │                         ▼                  ┌─────────┴─────────┐        │
//! │                     best common            ▼                   ▼        │
//! │                                      no consent            consent      │
//! │                                   NoCompatibleAlgorithm   best for the  │
//! │                                                           largest subset│
//! │                                                           downgraded    │
//! │                                                                         │
//! │  best = hybrid > post-quantum > classical, then security level,        │
//! │         then the lexicographically first id                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The result is signed by the local device. A downgraded result is never
//! produced without consent and always leaves an `AlgorithmDowngrade` event.

use serde::{Deserialize, Serialize};

use crate::config::NegotiationConfig;
use crate::crypto::{Algorithm, CapabilitySet, Signed, SigningKeyPair};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::events::{SecurityEventKind, SecurityEventLog};

/// Explicit user consent to encrypt below policy or without some devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowngradeConsent {
    /// Who agreed
    pub granted_by: String,
    /// Unix milliseconds
    pub granted_at: i64,
}

impl DowngradeConsent {
    pub fn new(granted_by: impl Into<String>) -> Self {
        Self {
            granted_by: granted_by.into(),
            granted_at: crate::time::now_timestamp_millis(),
        }
    }
}

/// Outcome of a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    pub conversation_id: String,
    pub algorithm: Algorithm,
    /// Devices that support `algorithm`, sorted
    pub participants: Vec<String>,
    /// Active devices left out because they lack `algorithm`, sorted
    pub excluded_devices: Vec<String>,
    pub downgraded: bool,
    /// Unix milliseconds
    pub negotiated_at: i64,
}

/// Best algorithm every capability set supports
///
/// Independent of the order of `sets`.
pub fn best_common_algorithm<'a, I>(sets: I) -> Option<Algorithm>
where
    I: IntoIterator<Item = &'a CapabilitySet>,
{
    let mut iter = sets.into_iter();
    let first = iter.next()?.clone();
    iter.fold(first, |acc, set| acc.intersection(set)).best()
}

/// Selects algorithms for conversations
#[derive(Debug, Clone)]
pub struct AlgorithmNegotiator {
    policy: NegotiationConfig,
    events: SecurityEventLog,
}

impl AlgorithmNegotiator {
    pub fn new(policy: NegotiationConfig, events: SecurityEventLog) -> Self {
        Self { policy, events }
    }

    /// Negotiate without signing
    pub fn select(
        &self,
        conversation_id: &str,
        devices: &[Device],
        consent: Option<&DowngradeConsent>,
    ) -> Result<Negotiation> {
        let mut active: Vec<&Device> = devices.iter().filter(|d| d.trust.is_active()).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active.dedup_by(|a, b| a.id == b.id);

        if active.is_empty() {
            return Err(Error::NoCompatibleAlgorithm(format!(
                "Conversation {} has no active participants",
                conversation_id
            )));
        }

        let common = best_common_algorithm(active.iter().map(|d| &d.capabilities));
        let meets_policy = |a: &Algorithm| a.family() >= self.policy.minimum_family;

        let negotiated_at = crate::time::now_timestamp_millis();
        let ids = |devices: &[&Device]| devices.iter().map(|d| d.id.clone()).collect::<Vec<_>>();

        if let Some(algorithm) = common.filter(meets_policy) {
            tracing::debug!(conversation = conversation_id, algorithm = %algorithm, "Negotiated algorithm");
            return Ok(Negotiation {
                conversation_id: conversation_id.to_string(),
                algorithm,
                participants: ids(&active[..]),
                excluded_devices: Vec::new(),
                downgraded: false,
                negotiated_at,
            });
        }

        let Some(consent) = consent else {
            let detail = match common {
                Some(best) => format!(
                    "best common algorithm {} is below the {} policy",
                    best, self.policy.minimum_family
                ),
                None => "participants share no algorithm".to_string(),
            };
            tracing::warn!(conversation = conversation_id, "Negotiation failed: {}", detail);
            return Err(Error::NoCompatibleAlgorithm(format!(
                "Conversation {}: {}",
                conversation_id, detail
            )));
        };

        // Largest supporting subset first, then preference
        let (algorithm, _) = Algorithm::ALL
            .iter()
            .map(|&a| (a, active.iter().filter(|d| d.capabilities.contains(a)).count()))
            .filter(|(_, count)| *count > 0)
            .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then(a.preference_cmp(b)))
            .ok_or_else(|| {
                Error::NoCompatibleAlgorithm(format!(
                    "Conversation {}: no participant declares any algorithm",
                    conversation_id
                ))
            })?;

        let (supporting, excluded): (Vec<&Device>, Vec<&Device>) = active
            .iter()
            .copied()
            .partition(|d| d.capabilities.contains(algorithm));
        let excluded_devices = ids(&excluded[..]);

        self.events.record(
            Some(conversation_id),
            None,
            SecurityEventKind::AlgorithmDowngrade {
                algorithm,
                excluded_devices: excluded_devices.clone(),
            },
        );
        tracing::warn!(
            conversation = conversation_id,
            algorithm = %algorithm,
            excluded = excluded_devices.len(),
            consent_by = %consent.granted_by,
            "Negotiated downgraded algorithm"
        );

        Ok(Negotiation {
            conversation_id: conversation_id.to_string(),
            algorithm,
            participants: ids(&supporting[..]),
            excluded_devices,
            downgraded: true,
            negotiated_at,
        })
    }

    /// Negotiate and sign the result with the local device key
    pub fn negotiate(
        &self,
        conversation_id: &str,
        devices: &[Device],
        consent: Option<&DowngradeConsent>,
        signer: &SigningKeyPair,
    ) -> Result<Signed<Negotiation>> {
        let negotiation = self.select(conversation_id, devices, consent)?;
        Signed::new(negotiation, signer)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AlgorithmFamily, PublicKeyBundle};
    use crate::device::{DeviceKind, TrustState};

    fn device(id: &str, caps: &[Algorithm]) -> Device {
        Device {
            id: id.into(),
            user_id: "user".into(),
            name: id.into(),
            kind: DeviceKind::Desktop,
            signing_public_key: [0u8; 32],
            public_keys: PublicKeyBundle::default(),
            capabilities: CapabilitySet::new(caps.iter().copied()),
            trust: TrustState::Trusted,
            fingerprint: "0".repeat(64),
            hardware_attributes: None,
            registered_at: 0,
            last_seen: 0,
            suspended_from: None,
            revocation: None,
        }
    }

    fn negotiator() -> AlgorithmNegotiator {
        AlgorithmNegotiator::new(NegotiationConfig::default(), SecurityEventLog::new())
    }

    #[test]
    fn test_classical_only_peer_forces_classical() {
        let a = device(
            "a",
            &[Algorithm::X25519Aes256Gcm, Algorithm::Kyber768Aes256Gcm],
        );
        let b = device("b", &[Algorithm::X25519Aes256Gcm]);

        let result = negotiator().select("conv", &[a, b], None).unwrap();
        assert_eq!(result.algorithm, Algorithm::X25519Aes256Gcm);
        assert!(!result.downgraded);
    }

    #[test]
    fn test_hybrid_preferred() {
        let all = Algorithm::ALL;
        let result = negotiator()
            .select("conv", &[device("a", &all), device("b", &all)], None)
            .unwrap();
        assert_eq!(result.algorithm.family(), AlgorithmFamily::Hybrid);
        // Equal level hybrids tie-break on the lexicographically first id
        assert_eq!(result.algorithm, Algorithm::X25519Kyber768Aes256Gcm);
    }

    #[test]
    fn test_security_level_breaks_family_tie() {
        let caps = [Algorithm::Kyber768Aes256Gcm, Algorithm::Kyber1024Aes256Gcm];
        let result = negotiator()
            .select("conv", &[device("a", &caps)], None)
            .unwrap();
        assert_eq!(result.algorithm, Algorithm::Kyber1024Aes256Gcm);
    }

    #[test]
    fn test_order_independent() {
        let a = device("a", &Algorithm::ALL);
        let b = device("b", &[Algorithm::X25519ChaCha20Poly1305, Algorithm::X25519Aes256Gcm]);
        let c = device("c", &[Algorithm::X25519ChaCha20Poly1305, Algorithm::X25519Aes256Gcm]);

        let n = negotiator();
        let forward = n.select("conv", &[a.clone(), b.clone(), c.clone()], None).unwrap();
        let backward = n.select("conv", &[c, b, a], None).unwrap();

        assert_eq!(forward.algorithm, backward.algorithm);
        assert_eq!(forward.participants, backward.participants);
        assert_eq!(forward.algorithm, Algorithm::X25519Aes256Gcm);
    }

    #[test]
    fn test_empty_intersection_without_consent() {
        let events = SecurityEventLog::new();
        let n = AlgorithmNegotiator::new(NegotiationConfig::default(), events.clone());
        let a = device("a", &[Algorithm::Kyber768Aes256Gcm]);
        let b = device("b", &[Algorithm::X25519Aes256Gcm]);

        let err = n.select("conv", &[a, b], None).unwrap_err();
        assert!(matches!(err, Error::NoCompatibleAlgorithm(_)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_consent_picks_largest_subset() {
        let events = SecurityEventLog::new();
        let n = AlgorithmNegotiator::new(NegotiationConfig::default(), events.clone());
        let a = device("a", &[Algorithm::X25519Aes256Gcm, Algorithm::Kyber768Aes256Gcm]);
        let b = device("b", &[Algorithm::X25519Aes256Gcm]);
        let c = device("c", &[Algorithm::Kyber1024Aes256Gcm]);

        let result = n
            .select("conv", &[a, b, c], Some(&DowngradeConsent::new("alice")))
            .unwrap();

        assert!(result.downgraded);
        assert_eq!(result.algorithm, Algorithm::X25519Aes256Gcm);
        assert_eq!(result.participants, vec!["a", "b"]);
        assert_eq!(result.excluded_devices, vec!["c"]);
        assert_eq!(
            events.count(|e| matches!(e.kind, SecurityEventKind::AlgorithmDowngrade { .. })),
            1
        );
    }

    #[test]
    fn test_minimum_family_policy() {
        let policy = NegotiationConfig {
            minimum_family: AlgorithmFamily::PostQuantum,
        };
        let n = AlgorithmNegotiator::new(policy, SecurityEventLog::new());
        let a = device("a", &[Algorithm::X25519Aes256Gcm]);

        let err = n.select("conv", &[a.clone()], None).unwrap_err();
        assert!(matches!(err, Error::NoCompatibleAlgorithm(_)));

        let result = n
            .select("conv", &[a], Some(&DowngradeConsent::new("alice")))
            .unwrap();
        assert!(result.downgraded);
        assert!(result.excluded_devices.is_empty());
    }

    #[test]
    fn test_inactive_devices_ignored() {
        let a = device("a", &[Algorithm::X25519Kyber768Aes256Gcm]);
        let mut b = device("b", &[Algorithm::X25519Aes256Gcm]);
        b.trust = TrustState::Suspended;

        let result = negotiator().select("conv", &[a, b], None).unwrap();
        assert_eq!(result.algorithm, Algorithm::X25519Kyber768Aes256Gcm);
        assert_eq!(result.participants, vec!["a"]);
    }

    #[test]
    fn test_signed_result() {
        let signer = SigningKeyPair::generate();
        let signed = negotiator()
            .negotiate("conv", &[device("a", &[Algorithm::X25519Aes256Gcm])], None, &signer)
            .unwrap();
        let negotiation = signed.verify_from(&signer.public_bytes()).unwrap();
        assert_eq!(negotiation.conversation_id, "conv");
    }
}
