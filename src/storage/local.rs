//! C1 LocalCache: in-process KV with TTL, background expiry, atomic SetNX/CAS.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{Error, Result};
use crate::lifecycle::Closeable;
use crate::storage::value::{Entry, Value};

/// Default interval for the background expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// In-process key-value store with TTL-based expiry.
///
/// Generic over [`Clock`] so tests can advance time deterministically; the
/// production default is [`SystemClock`]. A single `RwLock` guards the whole
/// map — many readers, exclusive writers, matching the spec's concurrency
/// model for this tier.
pub struct LocalCache<C: Clock = SystemClock> {
    store: RwLock<HashMap<String, Entry>>,
    clock: C,
    sweep_interval: Duration,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LocalCache<SystemClock> {
    pub fn new() -> Arc<Self> {
        Self::with_clock(SystemClock, DEFAULT_SWEEP_INTERVAL)
    }
}

impl<C: Clock + 'static> LocalCache<C> {
    pub fn with_clock(clock: C, sweep_interval: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            store: RwLock::new(HashMap::new()),
            clock,
            sweep_interval,
            sweeper: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });
        cache.spawn_sweeper();
        cache
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.cleanup_expired().await,
                    None => return,
                }
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.filter(|d| !d.is_zero())
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = Entry::new(value, self.now(), self.resolve_ttl(ttl));
        self.store.write().await.insert(key.to_string(), entry);
    }

    /// Returns the value if present and unexpired. An expired entry is
    /// dropped lazily: read under the shared lock first, and only if
    /// expired, drop it and re-acquire exclusively, rechecking expiry before
    /// deleting to tolerate a racing delete/overwrite (spec §9 two-phase
    /// approach, avoiding recursive read-to-write lock upgrade).
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.now();
        {
            let store = self.store.read().await;
            match store.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut store = self.store.write().await;
        if let Some(entry) = store.get(key) {
            if entry.is_expired(now) {
                store.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn delete(&self, key: &str) {
        self.store.write().await.remove(key);
    }

    /// Succeeds iff the key is absent or expired.
    pub async fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let now = self.now();
        let mut store = self.store.write().await;
        if let Some(existing) = store.get(key) {
            if !existing.is_expired(now) {
                return false;
            }
        }
        store.insert(key.to_string(), Entry::new(value, now, self.resolve_ttl(ttl)));
        true
    }

    /// Succeeds iff the current value equals `old`.
    pub async fn cas(&self, key: &str, old: &Value, new: Value, ttl: Option<Duration>) -> bool {
        let now = self.now();
        let mut store = self.store.write().await;
        let matches = match store.get(key) {
            Some(entry) if !entry.is_expired(now) => &entry.value == old,
            _ => false,
        };
        if matches {
            store.insert(key.to_string(), Entry::new(new, now, self.resolve_ttl(ttl)));
        }
        matches
    }

    /// Treats a missing or expired key as zero; stores the result as a
    /// signed 64-bit counter.
    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.now();
        let mut store = self.store.write().await;
        let current = match store.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.value.as_i64()?,
            _ => 0,
        };
        let next = current.wrapping_add(delta);
        let ttl = store.get(key).and_then(|e| {
            if e.is_expired(now) {
                None
            } else {
                e.expires_at.map(|at| at.saturating_duration_since(now))
            }
        });
        store.insert(key.to_string(), Entry::new(Value::Int64(next), now, ttl));
        Ok(next)
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    pub async fn set_expiration(&self, key: &str, ttl: Duration) -> bool {
        let now = self.now();
        let mut store = self.store.write().await;
        if let Some(entry) = store.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = self.resolve_ttl(Some(ttl)).map(|d| now + d);
                return true;
            }
        }
        false
    }

    pub async fn get_expiration(&self, key: &str) -> Option<Duration> {
        let now = self.now();
        let store = self.store.read().await;
        store.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                None
            } else {
                entry.expires_at.map(|at| at.saturating_duration_since(now))
            }
        })
    }

    /// Drops all expired entries in a single write critical section.
    pub async fn cleanup_expired(&self) {
        let now = self.now();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, entry| !entry.is_expired(now));
        let removed = before - store.len();
        if removed > 0 {
            debug!(removed, "local cache swept expired entries");
        }
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[async_trait]
impl<C: Clock + 'static> Closeable for LocalCache<C> {
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.store.write().await.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local_cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::TestClock;

    fn cache_with_test_clock() -> (Arc<LocalCache<TestClock>>, TestClock) {
        let clock = TestClock::new();
        let cache = LocalCache::with_clock(clock.clone(), Duration::from_secs(3600));
        (cache, clock)
    }

    #[tokio::test]
    async fn round_trip_set_get() {
        let (cache, _clock) = cache_with_test_clock();
        cache.set("k", Value::Str("v".into()), None).await;
        assert_eq!(cache.get("k").await, Some(Value::Str("v".into())));
    }

    #[tokio::test]
    async fn expired_entry_is_absent() {
        let (cache, clock) = cache_with_test_clock();
        cache
            .set("k", Value::Str("v".into()), Some(Duration::from_secs(10)))
            .await;
        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.get("k").await, None);
        assert!(!cache.exists("k").await);
    }

    #[tokio::test]
    async fn set_nx_only_succeeds_once() {
        let (cache, _clock) = cache_with_test_clock();
        assert!(cache.set_nx("k", Value::Int64(1), None).await);
        assert!(!cache.set_nx("k", Value::Int64(2), None).await);
        assert_eq!(cache.get("k").await, Some(Value::Int64(1)));
    }

    #[tokio::test]
    async fn set_nx_succeeds_after_expiry() {
        let (cache, clock) = cache_with_test_clock();
        cache
            .set_nx("k", Value::Int64(1), Some(Duration::from_secs(5)))
            .await;
        clock.advance(Duration::from_secs(6));
        assert!(cache.set_nx("k", Value::Int64(2), None).await);
        assert_eq!(cache.get("k").await, Some(Value::Int64(2)));
    }

    #[tokio::test]
    async fn cas_requires_matching_old_value() {
        let (cache, _clock) = cache_with_test_clock();
        cache.set("k", Value::Int64(1), None).await;
        assert!(!cache.cas("k", &Value::Int64(2), Value::Int64(3), None).await);
        assert!(cache.cas("k", &Value::Int64(1), Value::Int64(3), None).await);
        assert_eq!(cache.get("k").await, Some(Value::Int64(3)));
    }

    #[tokio::test]
    async fn incr_defaults_missing_to_zero() {
        let (cache, _clock) = cache_with_test_clock();
        assert_eq!(cache.incr("k").await.unwrap(), 1);
        assert_eq!(cache.incr_by("k", 41).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn cleanup_expired_drops_only_expired() {
        let (cache, clock) = cache_with_test_clock();
        cache
            .set("a", Value::Int64(1), Some(Duration::from_secs(5)))
            .await;
        cache.set("b", Value::Int64(2), None).await;
        clock.advance(Duration::from_secs(6));
        cache.cleanup_expired().await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("b").await, Some(Value::Int64(2)));
    }

    #[tokio::test]
    async fn close_empties_store() {
        let (cache, _clock) = cache_with_test_clock();
        cache.set("k", Value::Int64(1), None).await;
        cache.close().await.unwrap();
        assert_eq!(cache.len().await, 0);
    }
}
