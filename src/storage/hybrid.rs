//! C4 Hybrid Router: the policy core. Classifies keys by prefix and
//! dispatches Set/Get/Delete/atomic ops to the local, shared, and
//! persistent tiers per [`HybridConfig`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::config::{Category, HybridConfig};
use crate::core::error::{Error, Result};
use crate::lifecycle::Closeable;
use crate::storage::local::LocalCache;
use crate::storage::persistent::Persistent;
use crate::storage::shared::SharedCache;
use crate::storage::value::Value;

/// Owns the three tiers plus the mutable routing config. `shared` is
/// `None` in single-node deployments, in which case Shared/SharedPersistent
/// keys fall back to the local tier.
pub struct Hybrid {
    local: Arc<LocalCache>,
    shared: Option<Arc<dyn SharedCache>>,
    persistent: Arc<dyn Persistent>,
    config: RwLock<HybridConfig>,
}

impl Hybrid {
    pub fn new(
        local: Arc<LocalCache>,
        shared: Option<Arc<dyn SharedCache>>,
        persistent: Arc<dyn Persistent>,
        config: HybridConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            shared,
            persistent,
            config: RwLock::new(config),
        })
    }

    /// Pure function of `(key, config)`, stable across calls until the
    /// config changes (Testable Property 4).
    pub async fn classify(&self, key: &str) -> Category {
        self.config.read().await.classify(key)
    }

    /// Defensive copy of the current config.
    pub async fn get_config(&self) -> HybridConfig {
        self.config.read().await.clone()
    }

    pub async fn update_persistent_prefixes(&self, prefixes: Vec<String>) {
        self.config.write().await.update_persistent_prefixes(prefixes);
    }

    fn persistent_enabled(&self, cfg: &HybridConfig) -> bool {
        cfg.enable_persistent
    }

    fn resolve_ttl(category: Category, cfg: &HybridConfig, ttl: Option<Duration>) -> Option<Duration> {
        let default = match category {
            Category::Runtime | Category::Shared => cfg.default_cache_ttl,
            Category::Persistent => cfg.persistent_cache_ttl,
            Category::SharedPersistent => cfg.shared_cache_ttl,
        };
        Some(ttl.filter(|d| !d.is_zero()).unwrap_or(default))
    }

    /// Atomic operations prefer the shared tier, falling back to local,
    /// whenever a category is cluster-visible. The spec singles out
    /// Runtime and Shared for this preference (node-ID allocation is the
    /// motivating Runtime use case); SharedPersistent is cluster-visible by
    /// construction so it gets the same treatment.
    fn prefers_shared(category: Category) -> bool {
        matches!(category, Category::Runtime | Category::Shared | Category::SharedPersistent)
    }

    async fn shared_or_local_get(&self, key: &str) -> Result<Option<Value>> {
        match &self.shared {
            Some(shared) => shared.get(key).await,
            None => Ok(self.local.get(key).await),
        }
    }

    async fn shared_or_local_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        match &self.shared {
            Some(shared) => shared.set(key, value, ttl).await,
            None => {
                self.local.set(key, value, ttl).await;
                Ok(())
            }
        }
    }

    async fn shared_or_local_delete(&self, key: &str) -> Result<()> {
        match &self.shared {
            Some(shared) => shared.delete(key).await,
            None => {
                self.local.delete(key).await;
                Ok(())
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let category = self.classify(key).await;
        let cfg = self.get_config().await;
        let ttl = Self::resolve_ttl(category, &cfg, ttl);
        match category {
            Category::Runtime => {
                self.local.set(key, value, ttl).await;
                Ok(())
            }
            Category::Persistent => {
                if self.persistent_enabled(&cfg) {
                    self.persistent.set(key, value.clone()).await?;
                }
                self.local.set(key, value, ttl).await;
                Ok(())
            }
            Category::Shared => self.shared_or_local_set(key, value, ttl).await,
            Category::SharedPersistent => {
                if self.persistent_enabled(&cfg) {
                    self.persistent.set(key, value.clone()).await?;
                }
                self.shared_or_local_set(key, value, ttl).await
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let category = self.classify(key).await;
        let cfg = self.get_config().await;
        match category {
            Category::Runtime => Ok(self.local.get(key).await),
            Category::Persistent => {
                if let Some(v) = self.local.get(key).await {
                    return Ok(Some(v));
                }
                if !self.persistent_enabled(&cfg) {
                    return Ok(None);
                }
                match self.persistent.get(key).await? {
                    Some(v) => {
                        self.spawn_write_back_local(key.to_string(), v.clone(), cfg.persistent_cache_ttl);
                        Ok(Some(v))
                    }
                    None => Ok(None),
                }
            }
            Category::Shared => self.shared_or_local_get(key).await,
            Category::SharedPersistent => {
                if let Some(v) = self.shared_or_local_get(key).await? {
                    return Ok(Some(v));
                }
                if !self.persistent_enabled(&cfg) {
                    return Ok(None);
                }
                match self.persistent.get(key).await? {
                    Some(v) => {
                        self.spawn_write_back_shared(key.to_string(), v.clone(), cfg.shared_cache_ttl);
                        Ok(Some(v))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let category = self.classify(key).await;
        let cfg = self.get_config().await;
        match category {
            Category::Runtime => {
                self.local.delete(key).await;
                Ok(())
            }
            Category::Persistent => {
                if self.persistent_enabled(&cfg) {
                    self.persistent.delete(key).await?;
                }
                self.local.delete(key).await;
                Ok(())
            }
            Category::Shared => self.shared_or_local_delete(key).await,
            Category::SharedPersistent => {
                if self.persistent_enabled(&cfg) {
                    self.persistent.delete(key).await?;
                }
                self.shared_or_local_delete(key).await
            }
        }
    }

    /// Populates the local tier on a miss resolved by the persistent store.
    /// Runs detached: the `Get` caller does not wait on this, and repeated
    /// concurrent misses for the same key race harmlessly since the
    /// persistent value is the source of truth (last writer wins).
    fn spawn_write_back_local(&self, key: String, value: Value, ttl: Duration) {
        let local = self.local.clone();
        tokio::spawn(async move {
            local.set(&key, value, Some(ttl)).await;
            debug!(key, "wrote back to local cache after persistent hit");
        });
    }

    fn spawn_write_back_shared(&self, key: String, value: Value, ttl: Duration) {
        match self.shared.clone() {
            Some(shared) => {
                tokio::spawn(async move {
                    if let Err(e) = shared.set(&key, value, Some(ttl)).await {
                        warn!(key, error = %e, "write-back to shared cache failed");
                    }
                });
            }
            None => self.spawn_write_back_local(key, value, ttl),
        }
    }

    pub async fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let category = self.classify(key).await;
        let cfg = self.get_config().await;
        let ttl = Self::resolve_ttl(category, &cfg, ttl);
        if Self::prefers_shared(category) {
            match &self.shared {
                Some(shared) => shared.set_nx(key, value, ttl).await,
                None => Ok(self.local.set_nx(key, value, ttl).await),
            }
        } else {
            Ok(self.local.set_nx(key, value, ttl).await)
        }
    }

    pub async fn cas(&self, key: &str, old: &Value, new: Value, ttl: Option<Duration>) -> Result<bool> {
        let category = self.classify(key).await;
        let cfg = self.get_config().await;
        let ttl = Self::resolve_ttl(category, &cfg, ttl);
        if Self::prefers_shared(category) {
            match &self.shared {
                Some(shared) => shared.cas(key, old, new, ttl).await,
                None => Ok(self.local.cas(key, old, new, ttl).await),
            }
        } else {
            Ok(self.local.cas(key, old, new, ttl).await)
        }
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let category = self.classify(key).await;
        if Self::prefers_shared(category) {
            match &self.shared {
                Some(shared) => shared.incr_by(key, delta).await,
                None => self.local.incr_by(key, delta).await,
            }
        } else {
            self.local.incr_by(key, delta).await
        }
    }
}

#[async_trait]
impl Closeable for Hybrid {
    /// Tears down local, shared, persistent in that order, aggregating
    /// failures instead of stopping at the first one.
    async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        if let Err(e) = Closeable::close(self.local.as_ref()).await {
            failures.push(format!("local: {e}"));
        }
        if let Some(shared) = &self.shared {
            if let Err(e) = SharedCache::close(shared.as_ref()).await {
                failures.push(format!("shared: {e}"));
            }
        }
        if let Err(e) = Persistent::close(self.persistent.as_ref()).await {
            failures.push(format!("persistent: {e}"));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::persistent::{MemoryPersistent, NullPersistent};
    use crate::storage::shared::SharedMemory;

    fn hybrid_with_persistent(enable_persistent: bool) -> Arc<Hybrid> {
        let mut cfg = HybridConfig::default();
        cfg.enable_persistent = enable_persistent;
        Hybrid::new(
            LocalCache::new(),
            Some(Arc::new(SharedMemory::new())),
            Arc::new(MemoryPersistent::new()),
            cfg,
        )
    }

    fn hybrid_without_persistence() -> Arc<Hybrid> {
        Hybrid::new(
            LocalCache::new(),
            None,
            Arc::new(NullPersistent),
            HybridConfig {
                enable_persistent: false,
                ..HybridConfig::default()
            },
        )
    }

    // S1
    #[tokio::test]
    async fn persistent_category_without_persistence_round_trips_through_local() {
        let hybrid = hybrid_without_persistence();
        hybrid
            .set("tunnox:user:10000001", Value::Str("alice".into()), None)
            .await
            .unwrap();
        assert_eq!(
            hybrid.get("tunnox:user:10000001").await.unwrap(),
            Some(Value::Str("alice".into()))
        );
        assert_eq!(
            hybrid.classify("tunnox:user:10000001").await,
            Category::Persistent
        );
    }

    // S2
    #[tokio::test]
    async fn shared_persistent_write_through_populates_both_tiers() {
        let hybrid = hybrid_with_persistent(true);
        hybrid
            .set("tunnox:client_mappings:42", Value::Str("mapjson".into()), None)
            .await
            .unwrap();
        assert_eq!(
            hybrid.persistent.get("tunnox:client_mappings:42").await.unwrap(),
            Some(Value::Str("mapjson".into()))
        );
        assert_eq!(
            hybrid.shared.as_ref().unwrap().get("tunnox:client_mappings:42").await.unwrap(),
            Some(Value::Str("mapjson".into()))
        );
        assert_eq!(hybrid.local.get("tunnox:client_mappings:42").await, None);
    }

    // Property 3: write-back idempotence
    #[tokio::test]
    async fn write_back_repopulates_local_cache_after_miss() {
        let hybrid = hybrid_with_persistent(true);
        hybrid
            .set("tunnox:user:1", Value::Str("bob".into()), None)
            .await
            .unwrap();
        hybrid.local.delete("tunnox:user:1").await;
        let first = hybrid.get("tunnox:user:1").await.unwrap();
        // write-back runs detached; give it a chance to land.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let second = hybrid.get("tunnox:user:1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hybrid.local.get("tunnox:user:1").await, Some(Value::Str("bob".into())));
    }

    #[tokio::test]
    async fn runtime_key_never_touches_persistent() {
        let hybrid = hybrid_with_persistent(true);
        hybrid.set("anything:else", Value::Int64(7), None).await.unwrap();
        assert_eq!(hybrid.persistent.get("anything:else").await.unwrap(), None);
        assert_eq!(hybrid.get("anything:else").await.unwrap(), Some(Value::Int64(7)));
    }

    #[tokio::test]
    async fn update_persistent_prefixes_changes_classification() {
        let hybrid = hybrid_with_persistent(true);
        assert_eq!(hybrid.classify("tunnox:user:1").await, Category::Persistent);
        hybrid.update_persistent_prefixes(vec![]).await;
        assert_eq!(hybrid.classify("tunnox:user:1").await, Category::Runtime);
    }
}
