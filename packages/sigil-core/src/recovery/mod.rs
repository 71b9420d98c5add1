//! # Error Recovery
//!
//! Classifies failures and runs remediation.
//!
//! ## Classification
//!
//! | Kind | Severity | Automatic | Strategies |
//! |------|----------|-----------|------------|
//! | `NetworkUnavailable` | info | yes | retry with backoff |
//! | `KeyMismatchNeedsSetup` | warning | yes | renegotiate → re-register → force rotation → surface |
//! | `DeviceNotTrusted` | warning | yes | re-register → surface |
//! | `RatchetStateCorrupted` | critical | no | force rotation → surface |
//! | `IntegrityCheckFailed`, `FingerprintConflict` | critical | no | surface |
//! | everything else | warning | no | surface |
//!
//! Security failures are never resolved silently.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RECOVERY                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  error ──► process_error (pure) ──► ClassifiedError                    │
//! │                                          │                              │
//! │            ┌─────────────────────────────┴───────────┐                  │
//! │            ▼                                         ▼                  │
//! │       recoverable                              unrecoverable            │
//! │            │                                         │                  │
//! │  single flight per conversation            message marked               │
//! │  strategies tried in order                 undecryptable/undeliverable  │
//! │  each attempt → RecoveryAttempted event    threshold reached ⇒ sends   │
//! │                                            blocked until rotation       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{SecurityEventKind, SecurityEventLog};

/// One remediation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    Renegotiate,
    ReregisterDevice,
    ForceRotation,
    SurfaceToUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// The operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Encrypt,
    Decrypt,
    Setup,
    Rotate,
    KeyFetch,
    DeviceRegistration,
}

/// Where a failure happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: Operation,
    pub conversation_id: Option<String>,
    pub device_id: Option<String>,
    pub message_id: Option<String>,
    /// Zero-based retry count of the failing operation
    pub attempt: u32,
}

impl ErrorContext {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            conversation_id: None,
            device_id: None,
            message_id: None,
            attempt: 0,
        }
    }

    pub fn encrypt(conversation_id: &str) -> Self {
        Self::new(Operation::Encrypt).with_conversation(conversation_id)
    }

    pub fn decrypt(conversation_id: &str, message_id: Option<&str>) -> Self {
        let mut ctx = Self::new(Operation::Decrypt).with_conversation(conversation_id);
        ctx.message_id = message_id.map(str::to_string);
        ctx
    }

    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }
}

/// Output of [`process_error`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Recovery runs without asking the user
    pub recoverable: bool,
    /// Text for a user-visible security warning
    pub user_warning: Option<String>,
    /// Ordered; later entries are tried when earlier ones fail
    pub strategies: Vec<RecoveryStrategy>,
}

/// Classify a failure. Has no side effects.
pub fn process_error(error: &Error, ctx: &ErrorContext) -> ClassifiedError {
    use RecoveryStrategy::*;

    let kind = error.kind();
    let (severity, strategies) = match kind {
        ErrorKind::NetworkUnavailable => (Severity::Info, vec![RetryWithBackoff]),
        ErrorKind::KeyMismatchNeedsSetup => (
            Severity::Warning,
            vec![Renegotiate, ReregisterDevice, ForceRotation, SurfaceToUser],
        ),
        ErrorKind::DeviceNotTrusted => (Severity::Warning, vec![ReregisterDevice, SurfaceToUser]),
        ErrorKind::RatchetStateCorrupted => (Severity::Critical, vec![ForceRotation, SurfaceToUser]),
        ErrorKind::IntegrityCheckFailed | ErrorKind::FingerprintConflict => {
            (Severity::Critical, vec![SurfaceToUser])
        }
        ErrorKind::Internal => (Severity::Critical, vec![SurfaceToUser]),
        _ => (Severity::Warning, vec![SurfaceToUser]),
    };

    let user_warning = error.is_security_warning().then(|| {
        let scope = ctx
            .conversation_id
            .as_deref()
            .map(|c| format!(" in conversation {}", c))
            .unwrap_or_default();
        match kind {
            ErrorKind::IntegrityCheckFailed => {
                format!("A message{} failed verification and was not shown", scope)
            }
            ErrorKind::RatchetStateCorrupted => format!(
                "Message keys{} were reused; the conversation must be re-keyed",
                scope
            ),
            _ => format!("A device fingerprint{} does not match", scope),
        }
    });

    ClassifiedError {
        kind,
        severity,
        recoverable: error.is_transient() || error.is_auto_recoverable(),
        user_warning,
        strategies,
    }
}

/// Side effects recovery can ask for
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    /// Resynchronize devices and the conversation's key with the directory
    async fn renegotiate(&self, conversation_id: &str) -> Result<()>;

    /// Publish the local device again
    async fn reregister_device(&self) -> Result<()>;

    async fn force_rotation(&self, conversation_id: &str) -> Result<()>;
}

/// Delay before retry `attempt` (zero-based)
pub fn backoff_delay(config: &RecoveryConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay)
}

/// Run `op`, retrying transient failures with exponential backoff
pub async fn retry_with_backoff<T, F, Fut>(config: &RecoveryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < config.network_retries => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ConversationHealth {
    /// Consecutive key mismatches
    mismatches: u32,
    /// Unrecoverable failures since the last rotation
    unrecoverable: u32,
    /// Sends refused until a rotation
    blocked: bool,
}

/// Single-flight slot of one conversation
#[derive(Default)]
struct Flight {
    generation: AtomicU64,
    outcome: tokio::sync::Mutex<Option<Result<RecoveryStrategy>>>,
}

/// Runs recovery for one local device
pub struct ErrorRecoveryCoordinator {
    config: RecoveryConfig,
    events: SecurityEventLog,
    health: Mutex<HashMap<String, ConversationHealth>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl ErrorRecoveryCoordinator {
    pub fn new(config: RecoveryConfig, events: SecurityEventLog) -> Self {
        Self {
            config,
            events,
            health: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Perform one strategy
    ///
    /// A `RecoveryAttempted` event is recorded whatever the outcome. Only
    /// cancellation is returned as an error.
    pub async fn execute_recovery(
        &self,
        ctx: &ErrorContext,
        classified: &ClassifiedError,
        strategy: RecoveryStrategy,
        actions: &dyn RecoveryActions,
    ) -> Result<bool> {
        let conversation = ctx.conversation_id.as_deref();
        let missing = || Error::Internal(format!("{:?} needs a conversation", strategy));

        let result = match strategy {
            RecoveryStrategy::RetryWithBackoff => {
                tokio::time::sleep(backoff_delay(&self.config, ctx.attempt)).await;
                Ok(())
            }
            RecoveryStrategy::Renegotiate => match conversation {
                Some(c) => actions.renegotiate(c).await,
                None => Err(missing()),
            },
            RecoveryStrategy::ReregisterDevice => actions.reregister_device().await,
            RecoveryStrategy::ForceRotation => match conversation {
                Some(c) => actions.force_rotation(c).await,
                None => Err(missing()),
            },
            RecoveryStrategy::SurfaceToUser => Err(Error::Internal("Left to the user".into())),
        };

        let success = result.is_ok();
        self.events.record(
            conversation,
            ctx.device_id.as_deref(),
            SecurityEventKind::RecoveryAttempted {
                strategy,
                success,
                error: classified.kind,
            },
        );

        match result {
            Ok(()) => {
                if strategy == RecoveryStrategy::ForceRotation {
                    if let Some(c) = conversation {
                        self.rotation_completed(c);
                    }
                }
                tracing::info!(conversation, strategy = ?strategy, "Recovery succeeded");
                Ok(true)
            }
            Err(e @ Error::Cancelled(_)) => Err(e),
            Err(e) => {
                if strategy != RecoveryStrategy::SurfaceToUser {
                    tracing::warn!(conversation, strategy = ?strategy, "Recovery step failed: {}", e);
                }
                Ok(false)
            }
        }
    }

    /// Recover from `error`, or return the error to surface
    ///
    /// Concurrent calls for the same conversation run one recovery; the
    /// others wait and return its outcome. More than `max_attempts`
    /// consecutive key mismatches escalate to `RatchetStateCorrupted`.
    pub async fn recover(
        &self,
        error: &Error,
        ctx: &ErrorContext,
        actions: &dyn RecoveryActions,
    ) -> Result<RecoveryStrategy> {
        if matches!(error, Error::Cancelled(_)) {
            return Err(error.clone());
        }

        let classified = process_error(error, ctx);
        if !classified.recoverable {
            if let Some(warning) = &classified.user_warning {
                tracing::warn!(conversation = ?ctx.conversation_id, "Security warning: {}", warning);
            }
            self.mark_unrecoverable(error, ctx);
            return Err(error.clone());
        }

        let flight = self.flight_for(ctx.conversation_id.as_deref().unwrap_or(""));
        let observed = flight.generation.load(Ordering::SeqCst);
        let mut outcome = flight.outcome.lock().await;
        if flight.generation.load(Ordering::SeqCst) != observed {
            if let Some(result) = outcome.clone() {
                tracing::debug!(conversation = ?ctx.conversation_id, "Adopted concurrent recovery outcome");
                return result;
            }
        }

        let result = self.run_strategies(error, ctx, &classified, actions).await;

        *outcome = Some(result.clone());
        flight.generation.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn run_strategies(
        &self,
        error: &Error,
        ctx: &ErrorContext,
        classified: &ClassifiedError,
        actions: &dyn RecoveryActions,
    ) -> Result<RecoveryStrategy> {
        if classified.kind == ErrorKind::KeyMismatchNeedsSetup {
            if let Some(conversation) = ctx.conversation_id.as_deref() {
                let attempts = {
                    let mut health = self.health.lock();
                    let entry = health.entry(conversation.to_string()).or_default();
                    entry.mismatches += 1;
                    entry.mismatches
                };
                if attempts > self.config.max_attempts {
                    let escalated = Error::RatchetStateCorrupted(format!(
                        "Key setup for {} still mismatched after {} recoveries",
                        conversation, self.config.max_attempts
                    ));
                    tracing::warn!(conversation, attempts, "Escalating repeated key mismatch");
                    self.mark_unrecoverable(&escalated, ctx);
                    return Err(escalated);
                }
            }
        }

        for &strategy in &classified.strategies {
            if strategy == RecoveryStrategy::SurfaceToUser {
                break;
            }
            if self.execute_recovery(ctx, classified, strategy, actions).await? {
                return Ok(strategy);
            }
        }

        self.mark_unrecoverable(error, ctx);
        Err(error.clone())
    }

    /// Record a message that cannot be delivered or decrypted
    pub fn mark_unrecoverable(&self, error: &Error, ctx: &ErrorContext) {
        let kind = match ctx.operation {
            Operation::Decrypt => SecurityEventKind::MessageUndecryptable {
                message_id: ctx.message_id.clone(),
                error: error.kind(),
            },
            _ => SecurityEventKind::MessageUndeliverable { error: error.kind() },
        };
        self.events
            .record(ctx.conversation_id.as_deref(), ctx.device_id.as_deref(), kind);

        let Some(conversation) = ctx.conversation_id.as_deref() else {
            return;
        };
        let mut health = self.health.lock();
        let entry = health.entry(conversation.to_string()).or_default();
        entry.unrecoverable += 1;
        if entry.unrecoverable >= self.config.unrecoverable_threshold && !entry.blocked {
            entry.blocked = true;
            tracing::warn!(
                conversation,
                failures = entry.unrecoverable,
                "Sends blocked until the conversation key is rotated"
            );
        }
    }

    /// `RotationRequired` while the conversation is blocked
    pub fn ensure_send_allowed(&self, conversation_id: &str) -> Result<()> {
        let blocked = self
            .health
            .lock()
            .get(conversation_id)
            .map_or(false, |h| h.blocked);
        if blocked {
            Err(Error::RotationRequired(conversation_id.to_string()))
        } else {
            Ok(())
        }
    }

    /// A rotation clears every failure counter of the conversation
    pub fn rotation_completed(&self, conversation_id: &str) {
        self.health.lock().remove(conversation_id);
    }

    /// A successful operation ends a run of mismatches
    pub fn record_success(&self, conversation_id: &str) {
        if let Some(entry) = self.health.lock().get_mut(conversation_id) {
            entry.mismatches = 0;
        }
    }

    pub fn unrecoverable_count(&self, conversation_id: &str) -> u32 {
        self.health
            .lock()
            .get(conversation_id)
            .map_or(0, |h| h.unrecoverable)
    }

    fn flight_for(&self, key: &str) -> Arc<Flight> {
        self.flights
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[derive(Default)]
    struct Actions {
        renegotiations: AtomicUsize,
        registrations: AtomicUsize,
        rotations: AtomicUsize,
        renegotiate_fails: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl RecoveryActions for Actions {
        async fn renegotiate(&self, _conversation_id: &str) -> Result<()> {
            self.renegotiations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.renegotiate_fails.load(Ordering::SeqCst) {
                Err(Error::NetworkUnavailable("down".into()))
            } else {
                Ok(())
            }
        }

        async fn reregister_device(&self) -> Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Err(Error::DeviceRevoked("gone".into()))
        }

        async fn force_rotation(&self, _conversation_id: &str) -> Result<()> {
            self.rotations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            ..RecoveryConfig::default()
        }
    }

    fn mismatch() -> Error {
        Error::KeyMismatchNeedsSetup {
            conversation_id: "conv".into(),
            local: Some(1),
            remote: Some(2),
        }
    }

    #[test]
    fn test_security_failures_are_not_recoverable() {
        let ctx = ErrorContext::decrypt("conv", Some("m1"));
        for error in [
            Error::IntegrityCheckFailed("tag".into()),
            Error::RatchetStateCorrupted("reuse".into()),
            Error::FingerprintConflict("fp".into()),
        ] {
            let classified = process_error(&error, &ctx);
            assert!(!classified.recoverable);
            assert_eq!(classified.severity, Severity::Critical);
            assert!(classified.user_warning.is_some());
            assert_eq!(classified.strategies.last(), Some(&RecoveryStrategy::SurfaceToUser));
        }
    }

    #[test]
    fn test_classification_strategies() {
        let ctx = ErrorContext::encrypt("conv");

        let network = process_error(&Error::NetworkUnavailable("x".into()), &ctx);
        assert!(network.recoverable);
        assert_eq!(network.strategies, vec![RecoveryStrategy::RetryWithBackoff]);

        let mismatch = process_error(&mismatch(), &ctx);
        assert!(mismatch.recoverable);
        assert_eq!(mismatch.strategies[0], RecoveryStrategy::Renegotiate);
        assert!(mismatch.user_warning.is_none());

        let untrusted = process_error(&Error::DeviceNotTrusted("d".into()), &ctx);
        assert_eq!(untrusted.strategies[0], RecoveryStrategy::ReregisterDevice);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RecoveryConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_execute_records_event_even_on_failure() {
        let events = SecurityEventLog::new();
        let coordinator = ErrorRecoveryCoordinator::new(fast_config(), events.clone());
        let actions = Actions::default();
        let ctx = ErrorContext::encrypt("conv");
        let classified = process_error(&mismatch(), &ctx);

        let ok = coordinator
            .execute_recovery(&ctx, &classified, RecoveryStrategy::ReregisterDevice, &actions)
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.all()[0].kind,
            SecurityEventKind::RecoveryAttempted { success: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_recover_tries_strategies_in_order() {
        let coordinator = ErrorRecoveryCoordinator::new(fast_config(), SecurityEventLog::new());
        let actions = Actions::default();
        actions.renegotiate_fails.store(true, Ordering::SeqCst);

        let strategy = coordinator
            .recover(&mismatch(), &ErrorContext::encrypt("conv"), &actions)
            .await
            .unwrap();
        assert_eq!(strategy, RecoveryStrategy::ForceRotation);
        assert_eq!(actions.renegotiations.load(Ordering::SeqCst), 1);
        assert_eq!(actions.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(actions.rotations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_recoveries_single_flight() {
        let coordinator = ErrorRecoveryCoordinator::new(fast_config(), SecurityEventLog::new());
        let actions = Actions {
            delay: Duration::from_millis(20),
            ..Actions::default()
        };
        let ctx = ErrorContext::encrypt("conv");
        let error = mismatch();

        let (a, b) = tokio::join!(
            coordinator.recover(&error, &ctx, &actions),
            coordinator.recover(&error, &ctx, &actions),
        );
        assert_eq!(a.unwrap(), RecoveryStrategy::Renegotiate);
        assert_eq!(b.unwrap(), RecoveryStrategy::Renegotiate);
        assert_eq!(actions.renegotiations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_mismatch_escalates() {
        let coordinator = ErrorRecoveryCoordinator::new(fast_config(), SecurityEventLog::new());
        let actions = Actions::default();
        let ctx = ErrorContext::encrypt("conv");

        for _ in 0..3 {
            assert!(coordinator.recover(&mismatch(), &ctx, &actions).await.is_ok());
        }
        let err = coordinator.recover(&mismatch(), &ctx, &actions).await.unwrap_err();
        assert!(matches!(err, Error::RatchetStateCorrupted(_)));

        coordinator.record_success("conv");
        assert!(coordinator.recover(&mismatch(), &ctx, &actions).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrecoverable_failures_block_sends() {
        let events = SecurityEventLog::new();
        let coordinator = ErrorRecoveryCoordinator::new(fast_config(), events.clone());
        let actions = Actions::default();
        let ctx = ErrorContext::decrypt("conv", Some("m1"));
        let tampered = Error::IntegrityCheckFailed("tag".into());

        for _ in 0..3 {
            let err = coordinator.recover(&tampered, &ctx, &actions).await.unwrap_err();
            assert!(matches!(err, Error::IntegrityCheckFailed(_)));
        }
        assert_eq!(coordinator.unrecoverable_count("conv"), 3);
        assert!(matches!(
            coordinator.ensure_send_allowed("conv"),
            Err(Error::RotationRequired(_))
        ));
        assert_eq!(
            events.count(|e| matches!(e.kind, SecurityEventKind::MessageUndecryptable { .. })),
            3
        );

        let classified = process_error(&Error::RatchetStateCorrupted("x".into()), &ctx);
        coordinator
            .execute_recovery(&ctx, &classified, RecoveryStrategy::ForceRotation, &actions)
            .await
            .unwrap();
        assert!(coordinator.ensure_send_allowed("conv").is_ok());
        assert_eq!(coordinator.unrecoverable_count("conv"), 0);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_only_retries_transient() {
        let config = fast_config();
        let calls = AtomicUsize::new(0);

        let result: Result<u32> = retry_with_backoff(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::NetworkUnavailable("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let result: Result<u32> = retry_with_backoff(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::IntegrityCheckFailed("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
