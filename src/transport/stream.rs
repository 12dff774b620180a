//! C9 FrameStream: a half-closable `Read`/`Write` stream for one tunnel,
//! multiplexed (by discarding frames for other tunnels) over a shared
//! [`Conn`].

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::error::{Error, NetworkError, Result};
use crate::transport::conn::Conn;
use crate::transport::frame::{read_frame, write_frame, FrameType, TunnelId, MAX_FRAME_SIZE};

/// Lets a [`FrameStream`] ask whether its tunnel has already been torn
/// down by a higher-level demultiplexer, so a residual frame that arrives
/// after close is discarded instead of delivered.
pub trait TunnelStateTracker: Send + Sync + Debug {
    fn is_closed(&self, tunnel_id: TunnelId) -> bool;
}

/// Wraps one [`Conn`] + [`TunnelId`] into a half-closable stream. Reads and
/// writes each serialize through their own lock, per the spec's
/// concurrency model for a single conn shared by one tunnel's reader and
/// writer.
pub struct FrameStream {
    conn: Arc<Conn>,
    tunnel_id: TunnelId,
    read_buf: Mutex<VecDeque<u8>>,
    read_eof: AtomicBool,
    write_eof: AtomicBool,
    tracker: Option<Arc<dyn TunnelStateTracker>>,
}

impl FrameStream {
    pub fn new(conn: Arc<Conn>, tunnel_id: TunnelId) -> Self {
        Self {
            conn,
            tunnel_id,
            read_buf: Mutex::new(VecDeque::new()),
            read_eof: AtomicBool::new(false),
            write_eof: AtomicBool::new(false),
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TunnelStateTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn is_broken(&self) -> bool {
        self.conn.is_broken()
    }

    /// Reads up to `buf.len()` bytes. Demultiplexes by discarding frames
    /// whose tunnel ID doesn't match this stream's, and residual frames
    /// for a tunnel the tracker already reports closed. `Eof`/`Close`
    /// frames, or a transport error in the closed-not-broken allowlist (or
    /// any error once `CloseWrite` already ran locally), set read-EOF
    /// permanently and return `Ok(0)` without marking the conn broken. Any
    /// other transport error marks the conn broken and propagates.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.read_eof.load(Ordering::SeqCst) {
            return Ok(0);
        }
        loop {
            {
                let mut read_buf = self.read_buf.lock().await;
                if !read_buf.is_empty() {
                    let n = buf.len().min(read_buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = read_buf.pop_front().unwrap();
                    }
                    return Ok(n);
                }
            }

            let mut stream = self.conn.stream.lock().await;
            let frame = read_frame(&mut *stream).await;
            drop(stream);

            match frame {
                Ok(None) => {
                    self.read_eof.store(true, Ordering::SeqCst);
                    return Ok(0);
                }
                Ok(Some((id, frame_type, payload))) => {
                    if id != self.tunnel_id {
                        debug!("discarding frame for other tunnel");
                        continue;
                    }
                    if let Some(tracker) = &self.tracker {
                        if tracker.is_closed(id) {
                            debug!("discarding residual frame for closed tunnel");
                            continue;
                        }
                    }
                    match frame_type {
                        FrameType::Data => {
                            self.read_buf.lock().await.extend(payload);
                            continue;
                        }
                        FrameType::Eof | FrameType::Close => {
                            self.read_eof.store(true, Ordering::SeqCst);
                            return Ok(0);
                        }
                        _ => continue,
                    }
                }
                Err(Error::Io(io_err)) => {
                    if NetworkError::is_closed_not_broken(&io_err) || self.write_eof.load(Ordering::SeqCst) {
                        self.read_eof.store(true, Ordering::SeqCst);
                        return Ok(0);
                    }
                    self.conn.mark_broken();
                    return Err(Error::Io(io_err));
                }
                Err(other) => {
                    self.conn.mark_broken();
                    return Err(other);
                }
            }
        }
    }

    /// Auto-chunks payloads larger than `MAX_FRAME_SIZE` into back-to-back
    /// Data frames; returns the total bytes accepted.
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        if self.write_eof.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "closed pipe",
            )));
        }
        let mut stream = self.conn.stream.lock().await;
        for chunk in payload.chunks(MAX_FRAME_SIZE as usize) {
            if let Err(e) = write_frame(&mut *stream, self.tunnel_id, FrameType::Data, chunk).await {
                drop(stream);
                self.mark_broken_unless_closed(&e);
                return Err(e);
            }
        }
        Ok(payload.len())
    }

    fn mark_broken_unless_closed(&self, err: &Error) {
        if let Error::Io(io_err) = err {
            if NetworkError::is_closed_not_broken(io_err) {
                return;
            }
        }
        self.conn.mark_broken();
    }

    /// Half-close: emits an EOF frame. Idempotent.
    pub async fn close_write(&self) -> Result<()> {
        if self.write_eof.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut stream = self.conn.stream.lock().await;
        if let Err(e) = write_frame(&mut *stream, self.tunnel_id, FrameType::Eof, &[]).await {
            drop(stream);
            self.mark_broken_unless_closed(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Full-close: emits a Close frame. Does not close the underlying
    /// [`Conn`] — the caller is expected to release it back to the pool
    /// afterward.
    pub async fn close(&self) -> Result<()> {
        self.write_eof.store(true, Ordering::SeqCst);
        let mut stream = self.conn.stream.lock().await;
        if let Err(e) = write_frame(&mut *stream, self.tunnel_id, FrameType::Close, &[]).await {
            drop(stream);
            self.mark_broken_unless_closed(&e);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    fn stream_over(conn: TcpStream, tunnel_id: &str) -> FrameStream {
        let conn = Arc::new(Conn::new("peer".to_string(), conn, Instant::now()));
        FrameStream::new(conn, TunnelId::from_string(tunnel_id))
    }

    // S6
    #[tokio::test]
    async fn write_auto_chunks_at_max_frame_size() {
        let (server, client) = connected_pair().await;
        let a = stream_over(client, "t1");
        let b_conn = Arc::new(Conn::new("peer".to_string(), server, Instant::now()));

        let payload = vec![7u8; 70_000];
        let write_task = tokio::spawn(async move { a.write(&payload).await.unwrap() });

        let (id1, type1, p1) = read_frame(&mut *b_conn.stream.lock().await).await.unwrap().unwrap();
        let (id2, type2, p2) = read_frame(&mut *b_conn.stream.lock().await).await.unwrap().unwrap();

        assert_eq!(write_task.await.unwrap(), 70_000);
        assert_eq!(id1, TunnelId::from_string("t1"));
        assert_eq!(id2, id1);
        assert_eq!(type1, FrameType::Data);
        assert_eq!(type2, FrameType::Data);
        assert_eq!(p1.len(), 65536);
        assert_eq!(p2.len(), 4464);
    }

    #[tokio::test]
    async fn close_write_then_write_returns_closed_pipe() {
        let (server, client) = connected_pair().await;
        drop(server);
        let a = stream_over(client, "t1");
        a.close_write().await.ok();
        let err = a.write(b"x").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn read_discards_frames_for_other_tunnels() {
        let (mut server, client) = connected_pair().await;
        let a = stream_over(client, "mine");

        write_frame(&mut server, TunnelId::from_string("other"), FrameType::Data, b"not for you")
            .await
            .unwrap();
        write_frame(&mut server, TunnelId::from_string("mine"), FrameType::Data, b"hi")
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn eof_frame_sets_permanent_read_eof() {
        let (mut server, client) = connected_pair().await;
        let a = stream_over(client, "t1");
        write_frame(&mut server, TunnelId::from_string("t1"), FrameType::Eof, &[]).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    }
}
