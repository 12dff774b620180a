//! Resource-lifecycle supervisor (spec §6 external collaborator).
//!
//! Components that own background tasks or network resources — `LocalCache`
//! (sweeper task), `Hybrid` (tears down its tiers in order), `NodeConnPool`
//! (idle-eviction ticker) — implement [`Closeable`] and register themselves
//! with a [`ResourceSupervisor`] so an owning application can shut everything
//! down from one call site instead of threading `Arc`s through its own
//! shutdown path.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::{Error, Result};

/// A component with a graceful-shutdown hook.
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Tears the component down. Called at most once per supervisor;
    /// implementations should be idempotent where feasible since a caller
    /// may also close the component directly before supervisor shutdown.
    async fn close(&self) -> Result<()>;

    /// A short name used in `CleanupError` aggregation and log lines.
    fn name(&self) -> &'static str;
}

/// Collects [`Closeable`] handles and closes them in registration order,
/// aggregating failures instead of stopping at the first one.
#[derive(Default)]
pub struct ResourceSupervisor {
    components: Mutex<Vec<Arc<dyn Closeable>>>,
}

impl ResourceSupervisor {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
        }
    }

    /// Registers a component to be closed on [`Self::shutdown`].
    pub async fn register(&self, component: Arc<dyn Closeable>) {
        debug!(component = component.name(), "registered with resource supervisor");
        self.components.lock().await.push(component);
    }

    /// Closes every registered component in registration order. Returns
    /// `Ok(())` if all succeeded, or `Error::Cleanup` carrying one message
    /// per failure otherwise. Continues past failures rather than
    /// short-circuiting so one broken component doesn't strand the rest.
    pub async fn shutdown(&self) -> Result<()> {
        let components = self.components.lock().await;
        let mut failures = Vec::new();
        for component in components.iter() {
            if let Err(e) = component.close().await {
                warn!(component = component.name(), error = %e, "close failed during shutdown");
                failures.push(format!("{}: {}", component.name(), e));
            } else {
                debug!(component = component.name(), "closed");
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>, &'static str, bool);

    #[async_trait]
    impl Closeable for Counter {
        async fn close(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.2 {
                Err(Error::Storage("boom".into()))
            } else {
                Ok(())
            }
        }
        fn name(&self) -> &'static str {
            self.1
        }
    }

    #[tokio::test]
    async fn closes_all_registered_components() {
        let sup = ResourceSupervisor::new();
        let count = Arc::new(AtomicUsize::new(0));
        sup.register(Arc::new(Counter(count.clone(), "a", false))).await;
        sup.register(Arc::new(Counter(count.clone(), "b", false))).await;
        sup.shutdown().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn aggregates_failures_but_continues() {
        let sup = ResourceSupervisor::new();
        let count = Arc::new(AtomicUsize::new(0));
        sup.register(Arc::new(Counter(count.clone(), "a", true))).await;
        sup.register(Arc::new(Counter(count.clone(), "b", false))).await;
        let err = sup.shutdown().await.unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::Cleanup(v) if v.len() == 1));
    }
}
