//! C6 MetricsStore: counters/gauges/histograms with labels, and a
//! process-wide global accessor.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::core::error::{Error, Result};
use crate::lifecycle::Closeable;

/// A single label pair attached to a metric observation.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Derives the fingerprint `name{k1=v1,k2=v2,...}` with label keys sorted
/// lexicographically, so two calls with the same label set in different
/// insertion order land on the same counter.
pub fn metric_key(name: &str, labels: Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let pairs = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{pairs}}}")
}

/// Counters, gauges, and (currently no-op) histograms, keyed by
/// [`metric_key`]. Every public operation is safe for concurrent use from
/// any number of callers.
#[async_trait]
pub trait MetricsStore: Send + Sync + Debug {
    async fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        self.add_counter(name, 1, labels).await;
    }
    async fn add_counter(&self, name: &str, delta: i64, labels: Labels<'_>);
    async fn get_counter(&self, name: &str, labels: Labels<'_>) -> i64;
    async fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>);
    async fn get_gauge(&self, name: &str, labels: Labels<'_>) -> f64;
    /// No-op in the in-memory implementation; a real backend (e.g. the
    /// optional prometheus one) may record a distribution.
    async fn observe_histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    async fn close(&self) -> Result<()>;
}

/// In-process implementation backed by `DashMap`s of atomics, avoiding a
/// single global lock on the hot counter-increment path.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: DashMap<String, AtomicI64>,
    gauges: DashMap<String, AtomicI64>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetrics {
    async fn add_counter(&self, name: &str, delta: i64, labels: Labels<'_>) {
        let key = metric_key(name, labels);
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::SeqCst);
    }

    async fn get_counter(&self, name: &str, labels: Labels<'_>) -> i64 {
        let key = metric_key(name, labels);
        self.counters.get(&key).map(|v| v.load(Ordering::SeqCst)).unwrap_or(0)
    }

    async fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        let key = metric_key(name, labels);
        self.gauges
            .entry(key)
            .and_modify(|v| v.store(value.to_bits() as i64, Ordering::SeqCst))
            .or_insert_with(|| AtomicI64::new(value.to_bits() as i64));
    }

    async fn get_gauge(&self, name: &str, labels: Labels<'_>) -> f64 {
        let key = metric_key(name, labels);
        self.gauges
            .get(&key)
            .map(|v| f64::from_bits(v.load(Ordering::SeqCst) as u64))
            .unwrap_or(0.0)
    }

    async fn close(&self) -> Result<()> {
        self.counters.clear();
        self.gauges.clear();
        Ok(())
    }
}

#[async_trait]
impl Closeable for MemoryMetrics {
    async fn close(&self) -> Result<()> {
        MetricsStore::close(self).await
    }

    fn name(&self) -> &'static str {
        "memory_metrics"
    }
}

/// Selects a [`MetricsStore`] implementation.
pub enum MetricsBackend {
    Memory,
    #[cfg(feature = "metrics_prometheus")]
    Prometheus,
}

pub fn create_metrics_store(backend: MetricsBackend) -> Arc<dyn MetricsStore> {
    match backend {
        MetricsBackend::Memory => Arc::new(MemoryMetrics::new()),
        #[cfg(feature = "metrics_prometheus")]
        MetricsBackend::Prometheus => Arc::new(prometheus_backed::PrometheusMetrics::new()),
    }
}

static GLOBAL: OnceCell<RwLock<Option<Arc<dyn MetricsStore>>>> = OnceCell::new();

fn global_slot() -> &'static RwLock<Option<Arc<dyn MetricsStore>>> {
    GLOBAL.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide metrics store, replacing whatever was there.
pub async fn set_global(store: Arc<dyn MetricsStore>) -> Result<()> {
    *global_slot().write().await = Some(store);
    Ok(())
}

pub async fn try_global() -> Result<Arc<dyn MetricsStore>> {
    global_slot().read().await.clone().ok_or(Error::NotInitialized)
}

pub async fn teardown_global() -> Result<()> {
    let existing = global_slot().write().await.take();
    if let Some(store) = existing {
        store.close().await?;
    }
    Ok(())
}

/// Convenience wrapper: silently no-ops when the global store is unset,
/// since observability must never crash the caller.
pub async fn increment_counter(name: &str, labels: Labels<'_>) {
    match try_global().await {
        Ok(store) => store.increment_counter(name, labels).await,
        Err(_) => warn!(name, "increment_counter called with no global metrics store"),
    }
}

pub async fn add_counter(name: &str, delta: i64, labels: Labels<'_>) {
    if let Ok(store) = try_global().await {
        store.add_counter(name, delta, labels).await;
    }
}

pub async fn set_gauge(name: &str, value: f64, labels: Labels<'_>) {
    if let Ok(store) = try_global().await {
        store.set_gauge(name, value, labels).await;
    }
}

pub async fn observe_histogram(name: &str, value: f64, labels: Labels<'_>) {
    if let Ok(store) = try_global().await {
        store.observe_histogram(name, value, labels).await;
    }
}

#[cfg(feature = "metrics_prometheus")]
pub mod prometheus_backed {
    //! Forward-compatible prometheus slot, mirroring the teacher SDK's
    //! optional `prometheus` dependency and `advanced_metrics` feature.

    use super::*;
    use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    pub struct PrometheusMetrics {
        registry: Registry,
        counters: StdMutex<std::collections::HashMap<String, IntCounterVec>>,
        gauges: StdMutex<std::collections::HashMap<String, GaugeVec>>,
    }

    impl PrometheusMetrics {
        pub fn new() -> Self {
            Self {
                registry: Registry::new(),
                counters: StdMutex::new(std::collections::HashMap::new()),
                gauges: StdMutex::new(std::collections::HashMap::new()),
            }
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        fn label_names(labels: Labels<'_>) -> Vec<&str> {
            let mut names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
            names.sort_unstable();
            names
        }

        fn label_values<'a>(labels: Labels<'a>, names: &[&str]) -> Vec<&'a str> {
            names
                .iter()
                .map(|name| labels.iter().find(|(k, _)| k == name).map(|(_, v)| *v).unwrap_or(""))
                .collect()
        }
    }

    impl Default for PrometheusMetrics {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl MetricsStore for PrometheusMetrics {
        async fn add_counter(&self, name: &str, delta: i64, labels: Labels<'_>) {
            let names = Self::label_names(labels);
            let values = Self::label_values(labels, &names);
            let mut counters = self.counters.lock().unwrap();
            let vec = counters.entry(name.to_string()).or_insert_with(|| {
                let vec = IntCounterVec::new(Opts::new(name, name), &names).expect("valid counter opts");
                let _ = self.registry.register(Box::new(vec.clone()));
                vec
            });
            vec.with_label_values(&values).inc_by(delta.max(0) as u64);
        }

        async fn get_counter(&self, name: &str, labels: Labels<'_>) -> i64 {
            let names = Self::label_names(labels);
            let values = Self::label_values(labels, &names);
            let counters = self.counters.lock().unwrap();
            counters
                .get(name)
                .map(|vec| vec.with_label_values(&values).get() as i64)
                .unwrap_or(0)
        }

        async fn set_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
            let names = Self::label_names(labels);
            let values = Self::label_values(labels, &names);
            let mut gauges = self.gauges.lock().unwrap();
            let vec = gauges.entry(name.to_string()).or_insert_with(|| {
                let vec = GaugeVec::new(Opts::new(name, name), &names).expect("valid gauge opts");
                let _ = self.registry.register(Box::new(vec.clone()));
                vec
            });
            vec.with_label_values(&values).set(value);
        }

        async fn get_gauge(&self, name: &str, labels: Labels<'_>) -> f64 {
            let names = Self::label_names(labels);
            let values = Self::label_values(labels, &names);
            let gauges = self.gauges.lock().unwrap();
            gauges
                .get(name)
                .map(|vec| vec.with_label_values(&values).get())
                .unwrap_or(0.0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Closeable for PrometheusMetrics {
        async fn close(&self) -> Result<()> {
            MetricsStore::close(self).await
        }

        fn name(&self) -> &'static str {
            "prometheus_metrics"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_key_sorts_labels() {
        let a = metric_key("c", &[("b", "2"), ("a", "1")]);
        let b = metric_key("c", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "c{a=1,b=2}");
    }

    #[test]
    fn metric_key_without_labels_is_bare_name() {
        assert_eq!(metric_key("c", &[]), "c");
    }

    // S3
    #[tokio::test]
    async fn concurrent_increments_sum_exactly() {
        let store = Arc::new(MemoryMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.increment_counter("c", &[]).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get_counter("c", &[]).await, 1000);
    }

    #[tokio::test]
    async fn global_accessor_lifecycle() {
        teardown_global().await.unwrap();
        assert!(matches!(try_global().await, Err(Error::NotInitialized)));
        set_global(Arc::new(MemoryMetrics::new())).await.unwrap();
        increment_counter("g", &[]).await;
        let store = try_global().await.unwrap();
        assert_eq!(store.get_counter("g", &[]).await, 1);
        teardown_global().await.unwrap();
        // convenience wrapper silently no-ops once torn down.
        increment_counter("g", &[]).await;
    }
}
