//! C7 NodeConnPool: per-remote-node TCP connection pool with dial, reuse,
//! health probing, and idle eviction.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::error::{Error, NetworkError, Result};
use crate::lifecycle::Closeable;
use crate::storage::hybrid::Hybrid;
use crate::transport::conn::Conn;

pub const DEFAULT_CROSS_NODE_PORT: u16 = 50052;
pub const IDLE_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_conns: usize,
    pub max_conns: usize,
    pub idle_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 1,
            max_conns: 8,
            idle_timeout: Duration::from_secs(300),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct PoolStats {
    total_gets: AtomicI64,
    total_puts: AtomicI64,
    total_created: AtomicI64,
    total_closed: AtomicI64,
}

/// A snapshot of [`NodeConnPool`]'s counters, returned by `stats()`.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatsSnapshot {
    pub total_gets: i64,
    pub total_puts: i64,
    pub total_created: i64,
    pub total_closed: i64,
}

/// Per-remote-node pool: an MRU idle stack plus a live-connection count.
struct NodePool {
    node_id: String,
    addr: String,
    idle: Mutex<Vec<Arc<Conn>>>,
    total: AtomicUsize,
    notify: Notify,
}

impl NodePool {
    fn new(node_id: String, addr: String) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            addr,
            idle: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }
}

/// Manages one [`NodePool`] per remote node ID, dialing lazily and
/// reusing conns across tunnels. Address resolution consults
/// `tunnox:node:<id>:addr` via the storage layer (SharedPersistent
/// category), falling back to `<id>:50052`.
pub struct NodeConnPool {
    local_node_id: String,
    config: PoolConfig,
    pools: DashMap<String, Arc<NodePool>>,
    storage: Option<Arc<Hybrid>>,
    stats: PoolStats,
    eviction_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NodeConnPool {
    pub fn new(local_node_id: impl Into<String>, config: PoolConfig, storage: Option<Arc<Hybrid>>) -> Arc<Self> {
        let pool = Arc::new(Self {
            local_node_id: local_node_id.into(),
            config,
            pools: DashMap::new(),
            storage,
            stats: PoolStats::default(),
            eviction_task: std::sync::Mutex::new(None),
        });
        pool.spawn_eviction_ticker();
        pool
    }

    fn spawn_eviction_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_EVICTION_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => pool.evict_idle().await,
                    None => return,
                }
            }
        });
        *self.eviction_task.lock().unwrap() = Some(handle);
    }

    async fn resolve_addr(&self, node_id: &str) -> String {
        if let Some(storage) = &self.storage {
            let key = format!("tunnox:node:{node_id}:addr");
            if let Ok(Some(value)) = storage.get(&key).await {
                if let crate::storage::value::Value::Str(addr) = value {
                    return addr;
                }
            }
        }
        format!("{node_id}:{DEFAULT_CROSS_NODE_PORT}")
    }

    async fn node_pool(&self, node_id: &str) -> Arc<NodePool> {
        if let Some(existing) = self.pools.get(node_id) {
            return existing.clone();
        }
        // Double-checked creation: resolve the address (may be async I/O)
        // before taking the entry, then let the losing racer's pool be
        // dropped in favor of whichever `entry()` call wins.
        let addr = self.resolve_addr(node_id).await;
        let pool = self
            .pools
            .entry(node_id.to_string())
            .or_insert_with(|| NodePool::new(node_id.to_string(), addr))
            .clone();
        pool
    }

    /// Dials a new conn. Callers must have already reserved a slot in
    /// `pool.total` (see `reserve_slot`); a failed dial does not touch
    /// `pool.total` itself and leaves the compensating decrement to the
    /// caller.
    async fn dial(&self, pool: &NodePool) -> Result<Arc<Conn>> {
        let stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(&pool.addr))
            .await
            .map_err(|_| Error::Network(NetworkError::Timeout))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    Error::Network(NetworkError::ConnectionRefused)
                } else {
                    Error::Network(NetworkError::Io(e))
                }
            })?;
        let conn = Arc::new(Conn::new(pool.node_id.clone(), stream, Instant::now()));
        self.stats.total_created.fetch_add(1, Ordering::SeqCst);
        debug!(node_id = %pool.node_id, "dialed new conn");
        Ok(conn)
    }

    /// Atomically reserves one slot in `pool.total` against `limit`,
    /// returning `true` on success. Reserving before dialing (rather than
    /// checking `total < limit` and incrementing only once the dial
    /// finishes) keeps concurrent callers from all observing room under
    /// `limit` and all dialing, which would overshoot it.
    fn reserve_slot(pool: &NodePool, limit: usize) -> bool {
        pool.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if t < limit {
                    Some(t + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Opportunistically dials up to `min_conns` in the background right
    /// after pool creation.
    pub fn warmup(self: &Arc<Self>, node_id: &str) {
        let this = self.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            let pool = this.node_pool(&node_id).await;
            while Self::reserve_slot(&pool, this.config.min_conns) {
                match this.dial(&pool).await {
                    Ok(conn) => {
                        conn.mark_idle(Instant::now());
                        pool.idle.lock().await.push(conn);
                    }
                    Err(e) => {
                        pool.total.fetch_sub(1, Ordering::SeqCst);
                        warn!(node_id, error = %e, "warmup dial failed");
                        break;
                    }
                }
            }
        });
    }

    /// Acquires a conn to `node_id`, bounded by `deadline`. Rejects
    /// self-connect. Pops the most-recently-used idle conn if healthy;
    /// dials a new one if under `max_conns`; otherwise waits for a conn to
    /// free up until `deadline` elapses.
    pub async fn get(&self, node_id: &str, deadline: Duration) -> Result<Arc<Conn>> {
        if node_id == self.local_node_id {
            return Err(Error::Network(NetworkError::ConnectionRefused));
        }
        tokio::time::timeout(deadline, self.get_inner(node_id))
            .await
            .map_err(|_| Error::Network(NetworkError::Timeout))?
    }

    async fn get_inner(&self, node_id: &str) -> Result<Arc<Conn>> {
        let pool = self.node_pool(node_id).await;
        loop {
            let popped = pool.idle.lock().await.pop();
            if let Some(conn) = popped {
                let now = Instant::now();
                // Reuse-health-check order: not broken, not idle-timed-out,
                // then the optional soft probe (only bothered with once the
                // cheaper checks pass).
                let reusable = !conn.is_broken()
                    && !conn.is_idle_longer_than(self.config.idle_timeout, now)
                    && conn.probe_health().await
                    && !conn.is_broken();
                if reusable {
                    conn.mark_in_use(now);
                    self.stats.total_gets.fetch_add(1, Ordering::SeqCst);
                    return Ok(conn);
                }
                pool.total.fetch_sub(1, Ordering::SeqCst);
                self.stats.total_closed.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            if Self::reserve_slot(&pool, self.config.max_conns) {
                match self.dial(&pool).await {
                    Ok(conn) => {
                        conn.mark_in_use(Instant::now());
                        self.stats.total_gets.fetch_add(1, Ordering::SeqCst);
                        return Ok(conn);
                    }
                    Err(e) => {
                        pool.total.fetch_sub(1, Ordering::SeqCst);
                        pool.notify.notify_one();
                        return Err(e);
                    }
                }
            }
            pool.notify.notified().await;
        }
    }

    /// Returns `conn` to its pool. A broken conn is discarded instead of
    /// recycled.
    pub async fn put(&self, conn: Arc<Conn>) {
        self.stats.total_puts.fetch_add(1, Ordering::SeqCst);
        let pool = self.node_pool(&conn.node_id).await;
        if conn.is_broken() {
            pool.total.fetch_sub(1, Ordering::SeqCst);
            self.stats.total_closed.fetch_add(1, Ordering::SeqCst);
        } else {
            conn.mark_idle(Instant::now());
            pool.idle.lock().await.push(conn);
        }
        pool.notify.notify_one();
    }

    /// Explicitly discards `conn` regardless of its broken flag, e.g. when
    /// a caller decides a conn is unusable for reasons the pool can't see.
    pub async fn close_conn(&self, conn: Arc<Conn>) {
        conn.mark_broken();
        let pool = self.node_pool(&conn.node_id).await;
        pool.total.fetch_sub(1, Ordering::SeqCst);
        self.stats.total_closed.fetch_add(1, Ordering::SeqCst);
        pool.notify.notify_one();
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_gets: self.stats.total_gets.load(Ordering::SeqCst),
            total_puts: self.stats.total_puts.load(Ordering::SeqCst),
            total_created: self.stats.total_created.load(Ordering::SeqCst),
            total_closed: self.stats.total_closed.load(Ordering::SeqCst),
        }
    }

    /// Scans every node pool and closes idle conns that have sat longer
    /// than `idle_timeout`, never dropping a pool below `min_conns`.
    async fn evict_idle(&self) {
        let now = Instant::now();
        for entry in self.pools.iter() {
            let pool = entry.value();
            let mut idle = pool.idle.lock().await;
            let mut keep = Vec::with_capacity(idle.len());
            let mut evicted = 0;
            for conn in idle.drain(..) {
                let can_evict = pool.total.load(Ordering::SeqCst) - evicted > self.config.min_conns;
                if can_evict && conn.is_idle_longer_than(self.config.idle_timeout, now) {
                    evicted += 1;
                } else {
                    keep.push(conn);
                }
            }
            *idle = keep;
            if evicted > 0 {
                pool.total.fetch_sub(evicted, Ordering::SeqCst);
                self.stats.total_closed.fetch_add(evicted as i64, Ordering::SeqCst);
                debug!(node_id = %pool.node_id, evicted, "idle eviction sweep");
            }
        }
    }
}

#[async_trait::async_trait]
impl Closeable for NodeConnPool {
    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.eviction_task.lock().unwrap().take() {
            handle.abort();
        }
        for entry in self.pools.iter() {
            entry.value().idle.lock().await.clear();
        }
        self.pools.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "node_conn_pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr.to_string()
    }

    fn pool_for(addr: String, min: usize, max: usize) -> Arc<NodeConnPool> {
        let pool = NodeConnPool::new(
            "local-node",
            PoolConfig {
                min_conns: min,
                max_conns: max,
                idle_timeout: Duration::from_secs(300),
                dial_timeout: Duration::from_secs(2),
            },
            None,
        );
        // test-only: seed the address directly rather than wiring storage.
        pool.pools.insert(
            "remote".to_string(),
            NodePool::new("remote".to_string(), addr),
        );
        pool
    }

    #[tokio::test]
    async fn rejects_self_connect() {
        let pool = pool_for("127.0.0.1:1".to_string(), 0, 1);
        let err = pool
            .get("local-node", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::ConnectionRefused)));
    }

    // S5
    #[tokio::test]
    async fn pool_saturates_and_third_waiter_times_out() {
        let addr = echo_server().await;
        let pool = pool_for(addr, 1, 2);

        let c1 = pool.get("remote", Duration::from_millis(200)).await.unwrap();
        let c2 = pool.get("remote", Duration::from_millis(200)).await.unwrap();
        let third = pool.get("remote", Duration::from_millis(100)).await;
        assert!(third.is_err());

        pool.put(c1).await;
        pool.put(c2).await;
        assert_eq!(pool.stats().total_created, 2);
    }

    #[tokio::test]
    async fn put_then_get_reuses_the_same_conn_mru() {
        let addr = echo_server().await;
        let pool = pool_for(addr, 1, 2);
        let conn = pool.get("remote", Duration::from_millis(200)).await.unwrap();
        let ptr = Arc::as_ptr(&conn);
        pool.put(conn).await;
        let reused = pool.get("remote", Duration::from_millis(200)).await.unwrap();
        assert_eq!(Arc::as_ptr(&reused), ptr);
    }
}
