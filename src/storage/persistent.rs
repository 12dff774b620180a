//! C3 Persistent: durable KV with batch ops, prefix scan, and by-field query.

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::RwLock as StdRwLock;
use tracing::debug;

use crate::core::error::Result;
use crate::lifecycle::Closeable;
use crate::storage::value::Value;

/// Durable key-value store. Values round-trip so a string stays a string
/// and a byte array stays a byte array on readback (no double-encode);
/// structured values are JSON round-tripped. `QueryByField` prefix-scans,
/// decodes each entry, and numerically coerces integer queries across
/// int/int64/float64 the way the spec requires.
#[async_trait]
pub trait Persistent: Send + Sync + Debug {
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()>;
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>>;
    async fn batch_delete(&self, keys: &[String]) -> Result<()>;
    /// Returns up to `limit` entries whose key starts with `prefix`, as raw
    /// JSON (the wire-adjacent shape `QueryByField` also decodes from).
    async fn query_by_prefix(&self, prefix: &str, limit: usize) -> Result<BTreeMap<String, Json>>;
    /// Prefix-scans, decodes each entry as a JSON object, and returns those
    /// whose `field_name` equals `field_value` (numeric values are coerced
    /// across int/int64/float64 before comparison).
    async fn query_by_field(&self, prefix: &str, field_name: &str, field_value: &Json) -> Result<Vec<Json>>;
    async fn close(&self) -> Result<()>;
}

fn numerically_equal(a: &Json, b: &Json) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

/// Pure-memory mode: every operation is a well-defined no-op / not-found,
/// used when `EnablePersistent` is false.
#[derive(Debug, Default)]
pub struct NullPersistent;

#[async_trait]
impl Persistent for NullPersistent {
    async fn set(&self, _key: &str, _value: Value) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn batch_set(&self, _entries: Vec<(String, Value)>) -> Result<()> {
        Ok(())
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        Ok(vec![None; keys.len()])
    }

    async fn batch_delete(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }

    async fn query_by_prefix(&self, _prefix: &str, _limit: usize) -> Result<BTreeMap<String, Json>> {
        Ok(BTreeMap::new())
    }

    async fn query_by_field(&self, _prefix: &str, _field_name: &str, _field_value: &Json) -> Result<Vec<Json>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Closeable for NullPersistent {
    async fn close(&self) -> Result<()> {
        Persistent::close(self).await
    }

    fn name(&self) -> &'static str {
        "null_persistent"
    }
}

/// In-process durable-store stand-in, useful for tests exercising
/// `QueryByPrefix`/`QueryByField` without a real database. Backed by a
/// `BTreeMap` so prefix scans iterate in key order for free.
#[derive(Debug, Default)]
pub struct MemoryPersistent {
    store: StdRwLock<BTreeMap<String, Value>>,
}

impl MemoryPersistent {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistent for MemoryPersistent {
    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.store.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.write().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.read().unwrap().contains_key(key))
    }

    async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut store = self.store.write().unwrap();
        for (k, v) in entries {
            store.insert(k, v);
        }
        Ok(())
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let store = self.store.read().unwrap();
        Ok(keys.iter().map(|k| store.get(k).cloned()).collect())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut store = self.store.write().unwrap();
        for k in keys {
            store.remove(k);
        }
        Ok(())
    }

    async fn query_by_prefix(&self, prefix: &str, limit: usize) -> Result<BTreeMap<String, Json>> {
        let store = self.store.read().unwrap();
        Ok(store
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.to_raw_json()))
            .collect())
    }

    async fn query_by_field(&self, prefix: &str, field_name: &str, field_value: &Json) -> Result<Vec<Json>> {
        let store = self.store.read().unwrap();
        let mut matches = Vec::new();
        for (k, v) in store.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            let decoded = v.to_raw_json();
            if let Some(obj) = decoded.as_object() {
                if let Some(actual) = obj.get(field_name) {
                    if numerically_equal(actual, field_value) {
                        matches.push(decoded.clone());
                    }
                }
            }
        }
        debug!(prefix, field_name, matches = matches.len(), "query_by_field");
        Ok(matches)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Closeable for MemoryPersistent {
    async fn close(&self) -> Result<()> {
        Persistent::close(self).await
    }

    fn name(&self) -> &'static str {
        "memory_persistent"
    }
}

#[cfg(feature = "database")]
pub mod sql {
    //! `sqlx`-backed durable store, gated behind the `database` feature.
    //! Grounded on the teacher SDK's `DatabaseConnection` abstraction: one
    //! `(key, value_json, category)` row per entry in a single table.

    use super::*;
    use sqlx::sqlite::SqlitePool;
    use sqlx::Row;

    #[derive(Debug)]
    pub struct SqlPersistent {
        pool: SqlitePool,
    }

    impl SqlPersistent {
        pub async fn connect(url: &str) -> Result<Self> {
            let pool = SqlitePool::connect(url)
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite connect: {e}")))?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS tunnox_kv (
                    key TEXT PRIMARY KEY,
                    value_json TEXT NOT NULL
                )",
            )
            .execute(&pool)
            .await
            .map_err(|e| crate::core::error::Error::Storage(format!("sqlite migrate: {e}")))?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl Persistent for SqlPersistent {
        async fn set(&self, key: &str, value: Value) -> Result<()> {
            let encoded = value.to_raw_json().to_string();
            sqlx::query(
                "INSERT INTO tunnox_kv (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
            )
            .bind(key)
            .bind(encoded)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::core::error::Error::Storage(format!("sqlite set: {e}")))?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Value>> {
            let row = sqlx::query("SELECT value_json FROM tunnox_kv WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite get: {e}")))?;
            match row {
                Some(row) => {
                    let raw: String = row.get("value_json");
                    let json: Json = serde_json::from_str(&raw)
                        .map_err(|e| crate::core::error::Error::Storage(format!("sqlite decode: {e}")))?;
                    Ok(Some(Value::Json(json)))
                }
                None => Ok(None),
            }
        }

        async fn delete(&self, key: &str) -> Result<()> {
            sqlx::query("DELETE FROM tunnox_kv WHERE key = ?1")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite delete: {e}")))?;
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            Ok(self.get(key).await?.is_some())
        }

        async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite tx: {e}")))?;
            for (key, value) in entries {
                let encoded = value.to_raw_json().to_string();
                sqlx::query(
                    "INSERT INTO tunnox_kv (key, value_json) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                )
                .bind(key)
                .bind(encoded)
                .execute(&mut *tx)
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite batch_set: {e}")))?;
            }
            tx.commit()
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite commit: {e}")))?;
            Ok(())
        }

        async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                out.push(self.get(key).await?);
            }
            Ok(out)
        }

        async fn batch_delete(&self, keys: &[String]) -> Result<()> {
            for key in keys {
                self.delete(key).await?;
            }
            Ok(())
        }

        async fn query_by_prefix(&self, prefix: &str, limit: usize) -> Result<BTreeMap<String, Json>> {
            let like = format!("{prefix}%");
            let rows = sqlx::query("SELECT key, value_json FROM tunnox_kv WHERE key LIKE ?1 ORDER BY key LIMIT ?2")
                .bind(like)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| crate::core::error::Error::Storage(format!("sqlite scan: {e}")))?;
            let mut out = BTreeMap::new();
            for row in rows {
                let key: String = row.get("key");
                let raw: String = row.get("value_json");
                let json: Json = serde_json::from_str(&raw)
                    .map_err(|e| crate::core::error::Error::Storage(format!("sqlite decode: {e}")))?;
                out.insert(key, json);
            }
            Ok(out)
        }

        async fn query_by_field(&self, prefix: &str, field_name: &str, field_value: &Json) -> Result<Vec<Json>> {
            let scanned = self.query_by_prefix(prefix, usize::MAX).await?;
            Ok(scanned
                .into_values()
                .filter(|json| {
                    json.as_object()
                        .and_then(|obj| obj.get(field_name))
                        .map(|actual| numerically_equal(actual, field_value))
                        .unwrap_or(false)
                })
                .collect())
        }

        async fn close(&self) -> Result<()> {
            self.pool.close().await;
            Ok(())
        }
    }

    #[async_trait]
    impl Closeable for SqlPersistent {
        async fn close(&self) -> Result<()> {
            Persistent::close(self).await
        }

        fn name(&self) -> &'static str {
            "sql_persistent"
        }
    }
}
