//! Mockable time source for TTL bookkeeping.
//!
//! [`LocalCache`](crate::storage::local::LocalCache) and the pool's idle
//! eviction sweep both need "now" to compute expiry and staleness. Routing
//! that through a trait instead of calling `Instant::now()` directly lets
//! tests advance time deterministically instead of sleeping real wall time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Production clock backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only advances when told to. Stores an offset from a
/// fixed epoch instant so `now()` stays cheap and `Clone`-safe via `Arc`.
#[derive(Debug, Clone)]
pub struct TestClock {
    epoch: Instant,
    offset_millis: Arc<AtomicU64>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.offset_millis
            .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}
