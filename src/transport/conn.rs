//! The pooled duplex TCP connection wrapper and its broken/idle state
//! machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::warn;

use crate::core::error::NetworkError;

/// A duplex TCP connection to one remote node. `Idle -> InUse -> Idle` on
/// `Put`; any I/O error outside the "connection-closed" allowlist moves it
/// to `Broken`, which is terminal — a broken conn is always discarded at
/// `Put`, never reused.
pub struct Conn {
    pub node_id: String,
    pub stream: tokio::sync::Mutex<TcpStream>,
    pub created_at: Instant,
    last_used: StdMutex<Instant>,
    in_use: AtomicBool,
    broken: AtomicBool,
}

impl Conn {
    pub fn new(node_id: String, stream: TcpStream, now: Instant) -> Self {
        Self {
            node_id,
            stream: tokio::sync::Mutex::new(stream),
            created_at: now,
            last_used: StdMutex::new(now),
            in_use: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn mark_in_use(&self, now: Instant) {
        self.in_use.store(true, Ordering::SeqCst);
        *self.last_used.lock().unwrap() = now;
    }

    pub fn mark_idle(&self, now: Instant) {
        self.in_use.store(false, Ordering::SeqCst);
        *self.last_used.lock().unwrap() = now;
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Monotonic: once set, stays set.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_idle_longer_than(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used()) > timeout
    }

    /// Classifies an I/O error: the "connection-closed" allowlist never
    /// marks the conn broken since it represents a clean/expected
    /// teardown; anything else does.
    pub fn record_io_error(&self, err: &std::io::Error) {
        if NetworkError::is_closed_not_broken(err) {
            return;
        }
        warn!(node_id = %self.node_id, error = %err, "marking conn broken after I/O error");
        self.mark_broken();
    }

    /// Optional soft health probe: sets a 1ms read deadline and attempts a
    /// 1-byte read. A timeout means healthy (no data expected on an idle
    /// conn); any other error means unhealthy; unexpected bytes imply
    /// protocol desync, logged but still accepted per spec.
    ///
    /// `try_read` itself is non-blocking, so the deadline is placed on
    /// `readable()` (which does await the socket becoming readable) rather
    /// than on the read call itself.
    pub async fn probe_health(&self) -> bool {
        let stream = self.stream.lock().await;
        match tokio::time::timeout(Duration::from_millis(1), stream.readable()).await {
            Err(_elapsed) => true, // timed out waiting for readability: healthy
            Ok(Err(e)) => {
                self.record_io_error(&e);
                false
            }
            Ok(Ok(())) => {
                let mut buf = [0u8; 1];
                match stream.try_read(&mut buf) {
                    Ok(0) => false, // peer closed
                    Ok(n) => {
                        warn!(node_id = %self.node_id, bytes = n, "unexpected bytes on idle conn health probe");
                        true
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
                    Err(e) => {
                        self.record_io_error(&e);
                        false
                    }
                }
            }
        }
    }
}
