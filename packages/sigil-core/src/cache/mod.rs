//! # Key Cache and Performance Optimizer
//!
//! Unwrapped conversation keys are expensive to obtain (a directory round
//! trip plus a KEM decapsulation), so they are cached for a short time.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            KEY CACHE                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  entries   (conversation, version) ──► secret, expires_at              │
//! │  current   conversation ──► version                                     │
//! │                                                                         │
//! │  get_current(c)   = entries[(c, current[c])]  if unexpired              │
//! │  get(c, v)        = entries[(c, v)]            if unexpired              │
//! │                                                                         │
//! │  The current pointer only moves forward. A superseded version can be   │
//! │  read by number for historical decryption but is never served as       │
//! │  current.                                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adaptive Tuning
//!
//! ```text
//! ┌──────────────┐  record(sample)  ┌──────────────────────┐  configure()  ┌──────────┐
//! │ codec / keys │ ───────────────► │ PerformanceOptimizer │ ────────────► │ KeyCache │
//! └──────────────┘                  │  window of samples   │               └──────────┘
//!                                   │  retune() every tick │
//!                                   └──────────────────────┘
//!
//! low hit rate              → widen TTL
//! low load / many failures  → shrink batch size (latency over throughput)
//! sustained load            → grow batch size
//! compression not paying    → raise compression threshold
//! compression paying well   → lower compression threshold
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::conversation::ConversationSecret;
use crate::error::{Error, Result};

/// Runtime-adjustable cache behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTuning {
    #[serde(with = "crate::time::duration_ms")]
    pub ttl: Duration,
    pub batch_size: usize,
    pub compression_threshold: usize,
}

impl From<&CacheConfig> for CacheTuning {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl,
            batch_size: config.batch_size,
            compression_threshold: config.compression_threshold,
        }
    }
}

/// Counters since the cache was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Hits over lookups, or `None` before the first lookup
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

struct CacheEntry {
    secret: ConversationSecret,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(String, u32), CacheEntry>,
    current: HashMap<String, u32>,
}

/// Version-tagged cache of unwrapped conversation keys
pub struct KeyCache {
    inner: RwLock<CacheInner>,
    tuning: RwLock<CacheTuning>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl KeyCache {
    pub fn new(tuning: CacheTuning) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            tuning: RwLock::new(tuning),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(CacheTuning::from(config))
    }

    /// Replace the tuning; new TTLs apply to later inserts
    pub fn configure(&self, tuning: CacheTuning) -> Result<()> {
        if tuning.ttl.is_zero() || tuning.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "Cache ttl and batch size must be non-zero".into(),
            ));
        }
        *self.tuning.write() = tuning;
        tracing::debug!(
            ttl_ms = tuning.ttl.as_millis() as u64,
            batch_size = tuning.batch_size,
            compression_threshold = tuning.compression_threshold,
            "Cache reconfigured"
        );
        Ok(())
    }

    pub fn tuning(&self) -> CacheTuning {
        *self.tuning.read()
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The current key of a conversation
    pub fn get_current(&self, conversation_id: &str) -> Option<ConversationSecret> {
        let now = Instant::now();
        let found = {
            let inner = self.inner.read();
            inner.current.get(conversation_id).and_then(|version| {
                inner
                    .entries
                    .get(&(conversation_id.to_string(), *version))
                    .filter(|e| e.expires_at > now)
                    .map(|e| e.secret.clone())
            })
        };
        self.record_lookup(found.is_some());
        found
    }

    /// A specific version, current or not
    pub fn get(&self, conversation_id: &str, version: u32) -> Option<ConversationSecret> {
        let now = Instant::now();
        let found = self
            .inner
            .read()
            .entries
            .get(&(conversation_id.to_string(), version))
            .filter(|e| e.expires_at > now)
            .map(|e| e.secret.clone());
        self.record_lookup(found.is_some());
        found
    }

    /// Cache a key; with `make_current` it becomes the conversation's current
    /// key unless a newer version already is
    pub fn insert(&self, secret: ConversationSecret, make_current: bool) {
        let ttl = self.tuning.read().ttl;
        let conversation_id = secret.conversation_id.clone();
        let version = secret.version;

        let mut inner = self.inner.write();
        if make_current {
            let current = inner.current.entry(conversation_id.clone()).or_insert(version);
            if *current < version {
                *current = version;
            }
        }
        inner.entries.insert(
            (conversation_id, version),
            CacheEntry {
                secret,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn evict<F>(&self, predicate: F) -> usize
    where
        F: Fn(&(String, u32), &CacheEntry) -> bool,
    {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|k, e| !predicate(k, e));
        let removed = before - inner.entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every version of a conversation
    pub fn invalidate_conversation(&self, conversation_id: &str) -> usize {
        let removed = self.evict(|(c, _), _| c == conversation_id);
        self.inner.write().current.remove(conversation_id);
        tracing::debug!(conversation = conversation_id, removed, "Invalidated cached keys");
        removed
    }

    /// Drop versions older than `version`
    pub fn invalidate_below(&self, conversation_id: &str, version: u32) -> usize {
        let removed = self.evict(|(c, v), _| c == conversation_id && *v < version);
        let mut inner = self.inner.write();
        if inner.current.get(conversation_id).is_some_and(|v| *v < version) {
            inner.current.remove(conversation_id);
        }
        tracing::debug!(
            conversation = conversation_id,
            below = version,
            removed,
            "Invalidated superseded keys"
        );
        removed
    }

    /// Remove expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.evict(|_, e| e.expires_at <= now)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.inner.read().entries.len(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.current.clear();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// PERFORMANCE OPTIMIZER
// ============================================================================

/// Which operation a sample measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    KeyFetch,
    Rotate,
}

/// One measured operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSample {
    pub op: OperationKind,
    pub latency: Duration,
    pub ok: bool,
    /// Payload bytes before compression
    pub bytes_in: usize,
    /// Payload bytes after compression, or `bytes_in` when uncompressed
    pub bytes_out: usize,
    pub compressed: bool,
}

impl OperationSample {
    pub fn new(op: OperationKind, latency: Duration, ok: bool) -> Self {
        Self {
            op,
            latency,
            ok,
            bytes_in: 0,
            bytes_out: 0,
            compressed: false,
        }
    }

    pub fn with_compression(mut self, bytes_in: usize, bytes_out: usize) -> Self {
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
        self.compressed = true;
        self
    }
}

/// Samples kept between retunes
const SAMPLE_WINDOW: usize = 1024;

/// Hit rate below which the TTL is widened
const LOW_HIT_RATE: f64 = 0.5;

/// Lookups needed before the hit rate is trusted
const MIN_LOOKUPS: u64 = 8;

/// Failure ratio above which batches shrink
const HIGH_ERROR_RATE: f64 = 0.25;

/// Compressed/original ratio above which compression is not worth it
const POOR_COMPRESSION: f64 = 0.9;

/// Compressed/original ratio below which compression pays off
const GOOD_COMPRESSION: f64 = 0.5;

/// Collects operation telemetry and retunes the key cache
pub struct PerformanceOptimizer {
    cache: Arc<KeyCache>,
    bounds: CacheConfig,
    samples: Mutex<VecDeque<OperationSample>>,
    /// Cache counters at the previous retune
    last_stats: Mutex<CacheStats>,
}

impl PerformanceOptimizer {
    pub fn new(cache: Arc<KeyCache>, bounds: CacheConfig) -> Self {
        let last_stats = cache.stats();
        Self {
            cache,
            bounds,
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            last_stats: Mutex::new(last_stats),
        }
    }

    /// The cache this optimizer tunes
    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn record(&self, sample: OperationSample) {
        let mut samples = self.samples.lock();
        if samples.len() == SAMPLE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Samples waiting for the next retune
    pub fn pending_samples(&self) -> usize {
        self.samples.lock().len()
    }

    /// Apply the tuning rules to the samples gathered since the last retune
    ///
    /// Returns the new tuning when anything changed.
    pub fn retune(&self) -> Option<CacheTuning> {
        let samples: Vec<OperationSample> = self.samples.lock().drain(..).collect();
        let stats = self.cache.stats();
        let previous = std::mem::replace(&mut *self.last_stats.lock(), stats);

        let current = self.cache.tuning();
        let mut next = current;
        let bounds = &self.bounds;

        // TTL follows the hit rate of the last interval
        let hits = stats.hits.saturating_sub(previous.hits);
        let misses = stats.misses.saturating_sub(previous.misses);
        if hits + misses >= MIN_LOOKUPS {
            let hit_rate = hits as f64 / (hits + misses) as f64;
            if hit_rate < LOW_HIT_RATE {
                next.ttl = (current.ttl * 2).min(bounds.max_ttl);
            }
        }

        // Batch size follows load and failures
        let total = samples.len();
        let failures = samples.iter().filter(|s| !s.ok).count();
        let error_rate = if total > 0 { failures as f64 / total as f64 } else { 0.0 };
        if total < current.batch_size || error_rate > HIGH_ERROR_RATE {
            next.batch_size = (current.batch_size / 2).max(bounds.min_batch_size);
        } else if total >= current.batch_size * 4 {
            next.batch_size = (current.batch_size * 2).min(bounds.max_batch_size);
        }

        // Compression threshold follows the achieved ratio
        let (bytes_in, bytes_out) = samples
            .iter()
            .filter(|s| s.compressed && s.ok)
            .fold((0usize, 0usize), |(i, o), s| (i + s.bytes_in, o + s.bytes_out));
        if bytes_in > 0 {
            let ratio = bytes_out as f64 / bytes_in as f64;
            if ratio > POOR_COMPRESSION {
                next.compression_threshold =
                    (current.compression_threshold * 2).min(bounds.max_compression_threshold);
            } else if ratio < GOOD_COMPRESSION {
                next.compression_threshold =
                    (current.compression_threshold / 2).max(bounds.min_compression_threshold);
            }
        }

        if next == current {
            return None;
        }

        if self.cache.configure(next).is_err() {
            return None;
        }
        tracing::info!(
            samples = total,
            error_rate,
            ttl_ms = next.ttl.as_millis() as u64,
            batch_size = next.batch_size,
            compression_threshold = next.compression_threshold,
            "Retuned key cache"
        );
        Some(next)
    }

    /// Retune on a tokio interval until the handle is stopped or dropped
    pub fn spawn_autotune(self: &Arc<Self>, interval: Duration) -> AutotuneHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let optimizer = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        optimizer.retune();
                        optimizer.cache.purge_expired();
                    }
                }
            }
            tracing::debug!("Autotune stopped");
        });

        AutotuneHandle {
            token,
            handle: Some(handle),
        }
    }
}

/// Running autotune task; dropping it stops the task
pub struct AutotuneHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AutotuneHandle {
    /// Stop the task and wait for it to finish
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for AutotuneHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;

    fn secret(conversation: &str, version: u32) -> ConversationSecret {
        ConversationSecret::new(conversation, version, Algorithm::X25519Aes256Gcm, [version as u8; 32])
    }

    fn cache() -> KeyCache {
        KeyCache::from_config(&CacheConfig::default())
    }

    #[test]
    fn test_current_pointer_never_regresses() {
        let cache = cache();
        cache.insert(secret("c", 2), true);
        cache.insert(secret("c", 1), true);

        assert_eq!(cache.get_current("c").unwrap().version, 2);
        assert_eq!(cache.get("c", 1).unwrap().version, 1);
    }

    #[test]
    fn test_superseded_version_not_served_as_current() {
        let cache = cache();
        cache.insert(secret("c", 1), true);
        cache.invalidate_below("c", 2);

        assert!(cache.get_current("c").is_none());
        assert!(cache.get("c", 1).is_none());

        cache.insert(secret("c", 2), true);
        assert_eq!(cache.get_current("c").unwrap().version, 2);
    }

    #[test]
    fn test_historical_insert_does_not_move_pointer() {
        let cache = cache();
        cache.insert(secret("c", 3), true);
        cache.insert(secret("c", 4), false);
        assert_eq!(cache.get_current("c").unwrap().version, 3);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = KeyCache::new(CacheTuning {
            ttl: Duration::from_millis(20),
            batch_size: 1,
            compression_threshold: 1024,
        });
        cache.insert(secret("c", 1), true);
        assert!(cache.get_current("c").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get_current("c").is_none());
        assert_eq!(cache.purge_expired(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_invalidate_conversation() {
        let cache = cache();
        cache.insert(secret("a", 1), true);
        cache.insert(secret("a", 2), true);
        cache.insert(secret("b", 1), true);

        assert_eq!(cache.invalidate_conversation("a"), 2);
        assert!(cache.get_current("a").is_none());
        assert!(cache.get_current("b").is_some());
    }

    #[test]
    fn test_configure_rejects_zero() {
        let cache = cache();
        let mut tuning = cache.tuning();
        tuning.batch_size = 0;
        assert!(cache.configure(tuning).is_err());
    }

    fn optimizer() -> (Arc<KeyCache>, PerformanceOptimizer) {
        let cache = Arc::new(cache());
        let optimizer = PerformanceOptimizer::new(Arc::clone(&cache), CacheConfig::default());
        (cache, optimizer)
    }

    #[test]
    fn test_low_hit_rate_widens_ttl() {
        let (cache, optimizer) = optimizer();
        let before = cache.tuning().ttl;
        for _ in 0..10 {
            cache.get_current("missing");
        }

        let tuning = optimizer.retune().unwrap();
        assert_eq!(tuning.ttl, before * 2);
    }

    #[test]
    fn test_low_load_shrinks_batch() {
        let (cache, optimizer) = optimizer();
        optimizer.record(OperationSample::new(OperationKind::Encrypt, Duration::from_millis(1), true));

        let tuning = optimizer.retune().unwrap();
        assert_eq!(tuning.batch_size, 8);
        assert_eq!(cache.tuning().batch_size, 8);
    }

    #[test]
    fn test_sustained_load_grows_batch() {
        let (_, optimizer) = optimizer();
        for _ in 0..64 {
            optimizer.record(OperationSample::new(OperationKind::Encrypt, Duration::from_millis(1), true));
        }
        assert_eq!(optimizer.retune().unwrap().batch_size, 32);
        assert_eq!(optimizer.pending_samples(), 0);
    }

    #[test]
    fn test_compression_threshold_follows_ratio() {
        let (_, optimizer) = optimizer();
        for _ in 0..64 {
            optimizer.record(
                OperationSample::new(OperationKind::Encrypt, Duration::from_millis(1), true)
                    .with_compression(1000, 990),
            );
        }
        assert_eq!(optimizer.retune().unwrap().compression_threshold, 2048);

        for _ in 0..64 {
            optimizer.record(
                OperationSample::new(OperationKind::Encrypt, Duration::from_millis(1), true)
                    .with_compression(1000, 100),
            );
        }
        assert_eq!(optimizer.retune().unwrap().compression_threshold, 1024);
    }

    #[test]
    fn test_bounds_respected() {
        let (cache, optimizer) = optimizer();
        for _ in 0..20 {
            optimizer.retune();
        }
        assert_eq!(cache.tuning().batch_size, CacheConfig::default().min_batch_size);
    }

    #[tokio::test]
    async fn test_autotune_runs_and_stops() {
        let (cache, optimizer) = optimizer();
        let optimizer = Arc::new(optimizer);

        let handle = optimizer.spawn_autotune(Duration::from_millis(10));
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;

        // No load at all, so batches have shrunk
        assert!(cache.tuning().batch_size < CacheConfig::default().batch_size);
        handle.stop().await;
    }
}
