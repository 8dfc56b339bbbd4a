// src/cache.rs
//! Content-addressed result cache with TTL expiry and per-key singleflight.
//!
//! - Keys are SHA-256 digests of the normalized (unclipped) input.
//! - The backing store sits behind `ResultStore`; `InMemoryStore` is the default.
//! - Every store call is bounded by `store_timeout`. Errors and timeouts are logged
//!   and treated as a miss (reads) or dropped (writes).
//! - `compute_once` runs at most one computation per key at a time; the computation
//!   lives on its own task so an abandoned caller does not cancel it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::analyze::fusion::FusedScore;
use crate::analyze::input::AnalysisInput;
use crate::config::CacheSection;
use crate::error::{EngineError, StoreError};

// ------------------------------------------------------------
// Keys & entries
// ------------------------------------------------------------

/// 32-byte SHA-256 digest of the normalized input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn for_input(input: &AnalysisInput) -> Self {
        Self::for_normalized(&input.normalized())
    }

    pub fn for_normalized(normalized: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }

    /// First 6 bytes as hex; what goes into logs instead of the text.
    pub fn fingerprint(&self) -> String {
        hex(&self.0[..6])
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.fingerprint())
    }
}

const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Immutable stored result. Logically absent once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: FusedScore,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: FusedScore, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL)).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            key,
            value,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// How a result was obtained, surfaced as `X-Completeness-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry found in the store.
    Hit,
    /// This caller started the computation.
    Miss,
    /// Another caller's in-flight computation was awaited.
    Joined,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Joined => "JOINED",
        }
    }
}

// ------------------------------------------------------------
// Store abstraction
// ------------------------------------------------------------

/// Backing store. Implementations may be remote and fail; callers bound every call.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;
    /// Insert or replace the whole entry for `entry.key`.
    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError>;
    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;
    fn name(&self) -> &'static str;
}

pub type DynStore = Arc<dyn ResultStore>;

/// Bounded in-process store. Whole-entry replace under a `RwLock`.
pub struct InMemoryStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
}

impl InMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        match self.entries.write() {
            Ok(mut map) => {
                let before = map.len();
                map.retain(|_, e| !e.is_expired_at(now));
                before - map.len()
            }
            Err(_) => 0,
        }
    }

    /// Periodic purge on the current tokio runtime. Stops once the store is dropped.
    /// Returns `None` outside a runtime or when `every` is zero.
    pub fn spawn_sweeper(store: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        if every.is_zero() {
            return None;
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(store);
        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(target: "completeness", purged, "cache sweep");
                }
            }
        }))
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let now = Utc::now();
        {
            let map = self.entries.read().map_err(|_| StoreError::Poisoned)?;
            match map.get(key) {
                None => return Ok(None),
                Some(e) if !e.is_expired_at(now) => return Ok(Some(e.clone())),
                Some(_) => {}
            }
        }
        // lazy expiry
        let mut map = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        if map.get(key).is_some_and(|e| e.is_expired_at(now)) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let mut map = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        if !map.contains_key(&entry.key) && map.len() >= self.max_entries {
            let now = Utc::now();
            map.retain(|_, e| !e.is_expired_at(now));
            while map.len() >= self.max_entries {
                let Some(oldest) = map
                    .values()
                    .min_by_key(|e| e.created_at)
                    .map(|e| e.key)
                else {
                    break;
                };
                map.remove(&oldest);
            }
        }
        map.insert(entry.key, entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut map = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        map.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ------------------------------------------------------------
// Result cache
// ------------------------------------------------------------

type InflightMap = HashMap<CacheKey, watch::Receiver<Option<FusedScore>>>;

/// TTL cache front with singleflight. Cheap to clone.
#[derive(Clone)]
pub struct ResultCache {
    store: Option<DynStore>,
    ttl: Duration,
    store_timeout: Duration,
    inflight: Arc<Mutex<InflightMap>>,
}

impl ResultCache {
    pub fn new(store: Option<DynStore>, ttl: Duration, store_timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            store_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Default in-memory store sized from config, plus its sweeper when enabled.
    pub fn in_memory(cfg: &CacheSection) -> Self {
        let store = Arc::new(InMemoryStore::new(cfg.max_entries));
        if cfg.sweep_interval_secs > 0 {
            let _ = InMemoryStore::spawn_sweeper(
                &store,
                Duration::from_secs(cfg.sweep_interval_secs),
            );
        }
        Self::new(Some(store), cfg.ttl(), cfg.store_timeout())
    }

    /// No backing store: every lookup misses, singleflight still applies.
    pub fn uncached() -> Self {
        Self::new(None, Duration::from_secs(1), Duration::from_millis(1))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store_name(&self) -> &'static str {
        self.store.as_ref().map(|s| s.name()).unwrap_or("none")
    }

    /// Fresh value for `key`, or `None` (miss, expired, store error or timeout).
    pub async fn get(&self, key: &CacheKey) -> Option<FusedScore> {
        let store = self.store.as_ref()?;
        match tokio::time::timeout(self.store_timeout, store.get(key)).await {
            Ok(Ok(Some(entry))) if !entry.is_expired_at(Utc::now()) => Some(entry.value),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                store_failure("get", key, &e.to_string());
                None
            }
            Err(_) => {
                store_failure("get", key, "timeout");
                None
            }
        }
    }

    /// Write a new entry stamped now. Failures are logged and dropped.
    pub async fn set(&self, key: CacheKey, value: FusedScore) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let entry = CacheEntry::new(key, value, self.ttl, Utc::now());
        match tokio::time::timeout(self.store_timeout, store.set(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => store_failure("set", &key, &e.to_string()),
            Err(_) => store_failure("set", &key, "timeout"),
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once among all
    /// concurrent callers for the same key and share its result.
    pub async fn compute_once<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<(FusedScore, CacheStatus), EngineError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FusedScore> + Send + 'static,
    {
        if let Some(v) = self.get(&key).await {
            counter!("completeness_cache_hits_total").increment(1);
            debug!(target: "completeness", key = %key.fingerprint(), "cache hit");
            return Ok((v, CacheStatus::Hit));
        }

        let (mut rx, status) = {
            let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match map.get(&key) {
                Some(rx) => (rx.clone(), CacheStatus::Joined),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key, rx.clone());
                    self.spawn_leader(key, tx, compute);
                    (rx, CacheStatus::Miss)
                }
            }
        };

        match status {
            CacheStatus::Joined => {
                counter!("completeness_cache_joined_total").increment(1);
                debug!(target: "completeness", key = %key.fingerprint(), "joined in-flight computation");
            }
            _ => {
                counter!("completeness_cache_misses_total").increment(1);
                debug!(target: "completeness", key = %key.fingerprint(), "cache miss");
            }
        }

        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .ok()
            .and_then(|v| v.clone())
            .ok_or_else(|| EngineError::ComputationAborted(key.fingerprint()))?;
        Ok((value, status))
    }

    fn spawn_leader<F, Fut>(&self, key: CacheKey, tx: watch::Sender<Option<FusedScore>>, compute: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FusedScore> + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let slot = InflightSlot {
                map: Arc::clone(&cache.inflight),
                key,
                tx,
            };
            // A previous leader may have stored the value after our lookup.
            let value = match cache.get(&key).await {
                Some(v) => v,
                None => {
                    let v = compute().await;
                    cache.set(key, v.clone()).await;
                    v
                }
            };
            slot.publish(value);
        });
    }
}

/// Leader's hold on an in-flight key. Dropping it (also on panic) frees the key
/// before the sender goes away, so waiters never see a dead slot still registered.
struct InflightSlot {
    map: Arc<Mutex<InflightMap>>,
    key: CacheKey,
    tx: watch::Sender<Option<FusedScore>>,
}

impl InflightSlot {
    fn publish(&self, value: FusedScore) {
        let _ = self.tx.send(Some(value));
    }
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&self.key);
    }
}

fn store_failure(op: &'static str, key: &CacheKey, error: &str) {
    counter!("completeness_cache_store_errors_total", "op" => op).increment(1);
    warn!(
        target: "completeness",
        op,
        key = %key.fingerprint(),
        error,
        "cache store failed, continuing without cache"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::fusion::ScoreSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn score(v: f64) -> FusedScore {
        FusedScore {
            value: v,
            confidence: 0.5,
            band: 3,
            suggestions: vec!["s".into()],
            source: ScoreSource::RuleOnly,
        }
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::for_normalized(s)
    }

    fn memory_cache(ttl: Duration, max: usize) -> (ResultCache, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(max));
        let cache = ResultCache::new(
            Some(store.clone() as DynStore),
            ttl,
            Duration::from_millis(200),
        );
        (cache, store)
    }

    struct BrokenStore;

    #[async_trait]
    impl ResultStore for BrokenStore {
        async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _entry: CacheEntry) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &CacheKey) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    /// Never answers.
    struct HangingStore;

    #[async_trait]
    impl ResultStore for HangingStore {
        async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
            std::future::pending().await
        }
        async fn set(&self, _entry: CacheEntry) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &CacheKey) -> Result<(), StoreError> {
            std::future::pending().await
        }
        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    #[test]
    fn key_is_sha256_of_normalized_text() {
        let k = key("abc");
        assert_eq!(
            k.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(k.fingerprint(), "ba7816bf8f01");
        let input = AnalysisInput::new("  abc ", None).unwrap();
        assert_eq!(CacheKey::for_input(&input), k);
    }

    #[tokio::test]
    async fn set_then_get_until_expiry() {
        let (cache, store) = memory_cache(Duration::from_millis(60), 10);
        let k = key("a");
        assert!(cache.get(&k).await.is_none());
        cache.set(k, score(0.4)).await;
        assert_eq!(cache.get(&k).await, Some(score(0.4)));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get(&k).await.is_none());
        assert_eq!(store.len(), 0, "expired entry removed on read");
    }

    #[tokio::test]
    async fn full_store_evicts_oldest() {
        let (cache, store) = memory_cache(Duration::from_secs(60), 2);
        cache.set(key("1"), score(0.1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(key("2"), score(0.2)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(key("3"), score(0.3)).await;

        assert_eq!(store.len(), 2);
        assert!(cache.get(&key("1")).await.is_none());
        assert!(cache.get(&key("2")).await.is_some());
        assert!(cache.get(&key("3")).await.is_some());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = InMemoryStore::new(10);
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(10);
        store
            .set(CacheEntry::new(key("old"), score(0.1), Duration::from_secs(1), old))
            .await
            .unwrap();
        store
            .set(CacheEntry::new(key("new"), score(0.2), Duration::from_secs(60), now))
            .await
            .unwrap();
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        store.delete(&key("new")).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn compute_once_reports_miss_then_hit() {
        let (cache, _) = memory_cache(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));

        for expected in [CacheStatus::Miss, CacheStatus::Hit] {
            let r = Arc::clone(&runs);
            let (v, status) = cache
                .compute_once(key("x"), move || async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    score(0.7)
                })
                .await
                .unwrap();
            assert_eq!(status, expected);
            assert_eq!(v, score(0.7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_compute_once() {
        let (cache, _) = memory_cache(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let r = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .compute_once(key("same"), move || async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        score(0.9)
                    })
                    .await
            }));
        }
        let mut statuses = Vec::new();
        for h in handles {
            let (v, status) = h.await.unwrap().unwrap();
            assert_eq!(v, score(0.9));
            statuses.push(status);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(statuses.iter().filter(|s| **s == CacheStatus::Miss).count() >= 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let (cache, _) = memory_cache(Duration::from_secs(60), 10);
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .compute_once(key("slow"), || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        score(0.1)
                    })
                    .await
            })
        };
        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            cache.compute_once(key("fast"), || async { score(0.2) }),
        )
        .await
        .expect("unrelated key must not wait on the slow one")
        .unwrap();
        assert_eq!(fast.0, score(0.2));
        slow.abort();
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_computation() {
        let (cache, _) = memory_cache(Duration::from_secs(60), 10);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.compute_once(key("k"), move || async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                r.fetch_add(1, Ordering::SeqCst);
                score(0.6)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&key("k")).await, Some(score(0.6)));
    }

    #[tokio::test]
    async fn panicking_computation_is_reported_and_not_cached() {
        let (cache, store) = memory_cache(Duration::from_secs(60), 10);
        let err = cache
            .compute_once(key("boom"), || async {
                if true {
                    panic!("computation failed");
                }
                score(0.0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ComputationAborted(_)));
        assert!(store.is_empty());

        // slot was released: the next caller leads a fresh computation
        let (v, status) = cache
            .compute_once(key("boom"), || async { score(0.3) })
            .await
            .unwrap();
        assert_eq!((v, status), (score(0.3), CacheStatus::Miss));
    }

    #[tokio::test]
    async fn broken_store_fails_open() {
        let cache = ResultCache::new(
            Some(Arc::new(BrokenStore)),
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        assert_eq!(cache.store_name(), "broken");
        for _ in 0..2 {
            let (v, status) = cache
                .compute_once(key("x"), || async { score(0.5) })
                .await
                .unwrap();
            assert_eq!(v, score(0.5));
            assert_eq!(status, CacheStatus::Miss);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_to_miss() {
        let store_timeout = Duration::from_millis(30);
        let cache = ResultCache::new(
            Some(Arc::new(HangingStore)),
            Duration::from_secs(60),
            store_timeout,
        );

        let started = tokio::time::Instant::now();
        assert!(cache.get(&key("x")).await.is_none());
        assert!(started.elapsed() < store_timeout * 2);

        let started = tokio::time::Instant::now();
        let (v, status) = cache
            .compute_once(key("x"), || async { score(0.7) })
            .await
            .unwrap();
        assert_eq!(v, score(0.7));
        assert_eq!(status, CacheStatus::Miss);
        // lookup, leader re-check and write-back each give up after the timeout
        assert!(started.elapsed() < store_timeout * 4, "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn uncached_mode_still_computes() {
        let cache = ResultCache::uncached();
        assert_eq!(cache.store_name(), "none");
        let (v, status) = cache
            .compute_once(key("x"), || async { score(0.25) })
            .await
            .unwrap();
        assert_eq!((v, status), (score(0.25), CacheStatus::Miss));
        assert!(cache.get(&key("x")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_in_background() {
        let store = Arc::new(InMemoryStore::new(10));
        let old = Utc::now() - chrono::Duration::seconds(10);
        store
            .set(CacheEntry::new(key("old"), score(0.1), Duration::from_secs(1), old))
            .await
            .unwrap();
        let handle = InMemoryStore::spawn_sweeper(&store, Duration::from_secs(30)).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.is_empty());
        drop(store);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }
}
