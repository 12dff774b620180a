//! C2 SharedCache: same surface as [`LocalCache`](super::local::LocalCache)
//! but visible to other nodes, with atomic SetNX/CAS linearizable across all
//! participants and a per-call network deadline.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tracing::warn;

use crate::core::error::{Error, NetworkError, Result};
use crate::lifecycle::Closeable;
use crate::storage::value::Value;

/// Every call that may touch the network carries this deadline, per the
/// spec's 5-10s guidance for cross-node shared-cache operations.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Cross-node key-value store. Implementations may be backed by an
/// in-process stand-in ([`SharedMemory`], used for single-node deployments
/// and tests) or a real shared backend (e.g. the optional `redis`-backed
/// implementation behind the `shared_redis` feature).
#[async_trait]
pub trait SharedCache: Send + Sync + Debug {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Atomic across all participants: exactly one concurrent caller for a
    /// given key observes `true`.
    async fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;
    async fn cas(&self, key: &str, old: &Value, new: Value, ttl: Option<Duration>) -> Result<bool>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>>;
    async fn close(&self) -> Result<()>;
}

/// In-process stand-in for a real shared backend. Grounded on the same
/// locking discipline as [`super::local::LocalCache`] but through the
/// `Result`-returning trait surface, since a real network-backed
/// implementation can fail where the local tier never does.
#[derive(Debug)]
pub struct SharedMemory {
    inner: std::sync::Arc<super::local::LocalCache>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self {
            inner: super::local::LocalCache::new(),
        }
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for SharedMemory {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.get(key).await)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.exists(key).await)
    }

    async fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.inner.set_nx(key, value, ttl).await)
    }

    async fn cas(&self, key: &str, old: &Value, new: Value, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.inner.cas(key, old, new, ttl).await)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.inner.incr_by(key, delta).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.inner.set_expiration(key, ttl).await)
    }

    async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.inner.get_expiration(key).await)
    }

    async fn close(&self) -> Result<()> {
        Closeable::close(self.inner.as_ref()).await
    }
}

#[async_trait]
impl Closeable for SharedMemory {
    async fn close(&self) -> Result<()> {
        SharedCache::close(self).await
    }

    fn name(&self) -> &'static str {
        "shared_memory"
    }
}

/// Wraps a future with [`DEFAULT_CALL_TIMEOUT`], mapping a timeout into
/// `Error::Network(NetworkError::Timeout)`. Shared by every backend that
/// talks to the network.
pub(crate) async fn with_deadline<T, F>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(DEFAULT_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("shared cache call exceeded deadline");
            Err(Error::Network(NetworkError::Timeout))
        }
    }
}

#[cfg(feature = "shared_redis")]
pub mod redis_backed {
    //! Redis-backed [`SharedCache`], gated behind the `shared_redis`
    //! feature. Grounded on the teacher SDK's `redis_cache` feature slot:
    //! a real backend is opt-in, the in-process [`super::SharedMemory`]
    //! remains the default for tests and single-node use.

    use super::*;
    use redis::AsyncCommands;

    #[derive(Debug)]
    pub struct RedisSharedCache {
        client: redis::Client,
    }

    impl RedisSharedCache {
        pub fn new(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| Error::Storage(format!("redis client open: {e}")))?;
            Ok(Self { client })
        }

        async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| Error::Storage(format!("redis connect: {e}")))
        }

        fn encode(value: &Value) -> Result<Vec<u8>> {
            serde_json::to_vec(value).map_err(|e| Error::Storage(format!("redis encode: {e}")))
        }

        fn decode(raw: Vec<u8>) -> Result<Value> {
            serde_json::from_slice(&raw).map_err(|e| Error::Storage(format!("redis decode: {e}")))
        }
    }

    #[async_trait]
    impl SharedCache for RedisSharedCache {
        async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                let encoded = Self::encode(&value)?;
                match ttl.filter(|d| !d.is_zero()) {
                    Some(ttl) => {
                        let _: () = conn
                            .pset_ex(key, encoded, ttl.as_millis() as u64)
                            .await
                            .map_err(|e| Error::Storage(format!("redis set: {e}")))?;
                    }
                    None => {
                        let _: () = conn
                            .set(key, encoded)
                            .await
                            .map_err(|e| Error::Storage(format!("redis set: {e}")))?;
                    }
                }
                Ok(())
            })
            .await
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                let raw: Option<Vec<u8>> = conn
                    .get(key)
                    .await
                    .map_err(|e| Error::Storage(format!("redis get: {e}")))?;
                raw.map(Self::decode).transpose()
            })
            .await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                let _: () = conn
                    .del(key)
                    .await
                    .map_err(|e| Error::Storage(format!("redis del: {e}")))?;
                Ok(())
            })
            .await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                conn.exists(key)
                    .await
                    .map_err(|e| Error::Storage(format!("redis exists: {e}")))
            })
            .await
        }

        async fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                let encoded = Self::encode(&value)?;
                let set: bool = conn
                    .set_nx(key, encoded)
                    .await
                    .map_err(|e| Error::Storage(format!("redis setnx: {e}")))?;
                if set {
                    if let Some(ttl) = ttl.filter(|d| !d.is_zero()) {
                        let _: () = conn
                            .pexpire(key, ttl.as_millis() as i64)
                            .await
                            .map_err(|e| Error::Storage(format!("redis expire: {e}")))?;
                    }
                }
                Ok(set)
            })
            .await
        }

        async fn cas(&self, key: &str, old: &Value, new: Value, ttl: Option<Duration>) -> Result<bool> {
            // WATCH/MULTI/EXEC keeps this linearizable per key across
            // participants, matching the SharedCache atomicity contract.
            with_deadline(async {
                let mut conn = self.conn().await?;
                let old_encoded = Self::encode(old)?;
                let new_encoded = Self::encode(&new)?;
                let _: () = redis::cmd("WATCH")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Error::Storage(format!("redis watch: {e}")))?;
                let current: Option<Vec<u8>> = conn
                    .get(key)
                    .await
                    .map_err(|e| Error::Storage(format!("redis get: {e}")))?;
                if current.as_deref() != Some(old_encoded.as_slice()) {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| Error::Storage(format!("redis unwatch: {e}")))?;
                    return Ok(false);
                }
                let mut pipe = redis::pipe();
                pipe.atomic().set(key, new_encoded);
                if let Some(ttl) = ttl.filter(|d| !d.is_zero()) {
                    pipe.pexpire(key, ttl.as_millis() as i64);
                }
                let result: Option<()> = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Error::Storage(format!("redis exec: {e}")))?;
                Ok(result.is_some())
            })
            .await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                conn.incr(key, delta)
                    .await
                    .map_err(|e| Error::Storage(format!("redis incrby: {e}")))
            })
            .await
        }

        async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<bool> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                conn.pexpire(key, ttl.as_millis() as i64)
                    .await
                    .map_err(|e| Error::Storage(format!("redis expire: {e}")))
            })
            .await
        }

        async fn get_expiration(&self, key: &str) -> Result<Option<Duration>> {
            with_deadline(async {
                let mut conn = self.conn().await?;
                let ttl_ms: i64 = conn
                    .pttl(key)
                    .await
                    .map_err(|e| Error::Storage(format!("redis pttl: {e}")))?;
                Ok(if ttl_ms >= 0 {
                    Some(Duration::from_millis(ttl_ms as u64))
                } else {
                    None
                })
            })
            .await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Closeable for RedisSharedCache {
        async fn close(&self) -> Result<()> {
            SharedCache::close(self).await
        }

        fn name(&self) -> &'static str {
            "redis_shared_cache"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_trait_object() {
        let cache: std::sync::Arc<dyn SharedCache> = std::sync::Arc::new(SharedMemory::new());
        cache.set("k", Value::Str("v".into()), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::Str("v".into())));
    }

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let cache = SharedMemory::new();
        assert!(cache.set_nx("k", Value::Int64(1), None).await.unwrap());
        assert!(!cache.set_nx("k", Value::Int64(2), None).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_set_nx_has_exactly_one_winner() {
        let cache = std::sync::Arc::new(SharedMemory::new());
        let mut handles = Vec::new();
        for i in 0..50i64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.set_nx("race", Value::Int64(i), None).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
