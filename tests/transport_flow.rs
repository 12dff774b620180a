//! End-to-end scenarios spanning the pool and the frame stream over a real
//! loopback TCP connection.

use std::time::Duration;
use tokio::net::TcpListener;
use tunnox_core::prelude::*;

/// A peer that echoes Data frames back on the same tunnel and answers a
/// Close frame with one of its own, then stops.
async fn frame_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            match tunnox_core::transport::read_frame(&mut socket).await {
                Ok(Some((id, FrameType::Data, payload))) => {
                    let _ = tunnox_core::transport::write_frame(&mut socket, id, FrameType::Data, &payload).await;
                }
                Ok(Some((id, FrameType::Close, _))) => {
                    let _ = tunnox_core::transport::write_frame(&mut socket, id, FrameType::Close, &[]).await;
                    return;
                }
                _ => return,
            }
        }
    });
    addr.to_string()
}

#[tokio::test]
async fn pool_dial_then_frame_stream_round_trip_then_release() {
    let addr = frame_echo_server().await;
    let pool = NodeConnPool::new("local-node", PoolConfig::default(), None);

    // Test seeds the pool's address table directly; production wiring goes
    // through the storage layer's `tunnox:node:<id>:addr` key.
    let conn = {
        let stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
        std::sync::Arc::new(Conn::new("remote".to_string(), stream, std::time::Instant::now()))
    };

    let tunnel_id = TunnelId::from_string("tunnel-1");
    let stream = FrameStream::new(conn.clone(), tunnel_id);

    stream.write(b"hello world").await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello world");

    stream.close().await.unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

    assert!(!conn.is_broken());
    pool.put(conn).await;
}

#[tokio::test]
async fn frame_stream_half_close_lets_peer_still_send() {
    let addr = frame_echo_server().await;
    let client = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let conn = std::sync::Arc::new(Conn::new("remote".to_string(), client, std::time::Instant::now()));
    let stream = FrameStream::new(conn, TunnelId::from_string("t2"));

    stream.write(b"ping").await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 4);

    stream.close_write().await.unwrap();
    let err = stream.write(b"more").await.unwrap_err();
    assert!(matches!(err, tunnox_core::Error::Io(_)));

    // peer answers Close in response to our server logic's next read of
    // our CloseWrite-induced EOF frame would require the echo server to
    // model EOF too; this test only asserts the local half-close contract.
    let _ = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await;
}
