use super::*;

use sluice_protocol::wire;
use tokio::net::TcpListener;

/// Spawn a fake peer that accepts one connection, decodes frames, and
/// answers each with the given status byte. Returns the address and a
/// channel of decoded batches.
async fn spawn_peer(
    status: SendStatus,
) -> (
    std::net::SocketAddr,
    tokio::sync::mpsc::UnboundedReceiver<Vec<LogEntry>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to get addr");
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };

        loop {
            let mut len_bytes = [0u8; 4];
            if stream.read_exact(&mut len_bytes).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes(len_bytes) as usize;
            let mut frame = vec![0u8; len];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }
            let batch = wire::decode_batch(&frame).expect("peer got bad frame");
            let _ = tx.send(batch);
            if stream.write_all(&[status.as_byte()]).await.is_err() {
                return;
            }
        }
    });

    (addr, rx)
}

#[tokio::test]
async fn send_receives_ok() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;

    let mut conn = PeerConnection::connect(&addr.ip().to_string(), addr.port(), SEC)
        .await
        .expect("connect failed");

    let batch = vec![
        LogEntry::new("web", &b"one"[..]),
        LogEntry::new("web", &b"two"[..]),
    ];
    let status = conn.send(&batch).await.expect("send failed");

    assert_eq!(status, SendStatus::Ok);
    assert_eq!(rx.recv().await.expect("no batch"), batch);
}

#[tokio::test]
async fn send_receives_try_again() {
    let (addr, _rx) = spawn_peer(SendStatus::TryAgain).await;

    let mut conn = PeerConnection::connect(&addr.ip().to_string(), addr.port(), SEC)
        .await
        .expect("connect failed");

    let status = conn
        .send(&[LogEntry::new("web", &b"x"[..])])
        .await
        .expect("send failed");
    assert_eq!(status, SendStatus::TryAgain);
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    // Bind then drop to get a port nothing is listening on
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");
    drop(listener);

    let result = PeerConnection::connect(&addr.ip().to_string(), addr.port(), SEC).await;
    assert!(matches!(result, Err(ConnError::ConnectFailed { .. })));
}

#[tokio::test]
async fn peer_hangup_is_an_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");

    tokio::spawn(async move {
        // Accept and immediately hang up without answering
        let _ = listener.accept().await;
    });

    let mut conn = PeerConnection::connect(&addr.ip().to_string(), addr.port(), SEC)
        .await
        .expect("connect failed");

    let result = conn.send(&[LogEntry::new("web", &b"x"[..])]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_status_byte_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept failed");
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await.expect("read len");
        let mut frame = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
        stream.read_exact(&mut frame).await.expect("read frame");
        stream.write_all(&[0xAB]).await.expect("write status");
    });

    let mut conn = PeerConnection::connect(&addr.ip().to_string(), addr.port(), SEC)
        .await
        .expect("connect failed");

    let result = conn.send(&[LogEntry::new("web", &b"x"[..])]).await;
    assert!(matches!(result, Err(ConnError::BadResponse(0xAB))));
}

const SEC: Duration = Duration::from_secs(1);
