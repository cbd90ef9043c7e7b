//! End-to-end outage drill: a buffer store over a real network store,
//! against a peer that starts refusing batches mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sluice_protocol::{wire, LogEntry, SendStatus};
use sluice_store::{BufferState, BufferStore, Store, StoreContext, StoreOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Peer that accepts connections forever but only commits batches while
/// `healthy` is set; otherwise it answers TRY_AGAIN.
async fn spawn_peer() -> (
    std::net::SocketAddr,
    Arc<AtomicBool>,
    mpsc::UnboundedReceiver<Vec<LogEntry>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");
    let healthy = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::unbounded_channel();

    let healthy_flag = Arc::clone(&healthy);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let tx = tx.clone();
            let healthy = Arc::clone(&healthy_flag);
            tokio::spawn(async move {
                loop {
                    let mut len_bytes = [0u8; 4];
                    if stream.read_exact(&mut len_bytes).await.is_err() {
                        return;
                    }
                    let mut frame = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
                    if stream.read_exact(&mut frame).await.is_err() {
                        return;
                    }
                    let status = if healthy.load(Ordering::SeqCst) {
                        let batch = wire::decode_batch(&frame).expect("bad frame");
                        let _ = tx.send(batch);
                        SendStatus::Ok
                    } else {
                        SendStatus::TryAgain
                    };
                    if stream.write_all(&[status.as_byte()]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, healthy, rx)
}

fn batch(payloads: &[&str]) -> Vec<LogEntry> {
    payloads
        .iter()
        .map(|p| LogEntry::new("web", p.as_bytes().to_vec()))
        .collect()
}

fn drain_payloads(rx: &mut mpsc::UnboundedReceiver<Vec<LogEntry>>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        for entry in batch {
            payloads.push(String::from_utf8_lossy(&entry.message).into_owned());
        }
    }
    payloads
}

#[tokio::test]
async fn buffer_over_network_survives_an_outage() {
    let (addr, healthy, mut rx) = spawn_peer().await;
    let spool = tempfile::TempDir::new().expect("tempdir");

    let mut store = BufferStore::new(StoreContext::default(), "web", false);
    store.configure(
        &StoreOptions::new()
            .with_int("retry_interval", 0)
            .with_int("retry_interval_range", 0)
            .with_int("buffer_send_rate", 2)
            .with_section(
                "primary",
                StoreOptions::new()
                    .with_str("type", "network")
                    .with_str("remote_host", addr.ip().to_string())
                    .with_int("remote_port", addr.port() as i64)
                    .with_int("timeout_ms", 1000),
            )
            .with_section(
                "secondary",
                StoreOptions::new()
                    .with_str("type", "file")
                    .with_str("file_path", spool.path().to_string_lossy()),
            ),
    );

    assert!(store.open().await);
    assert_eq!(store.state(), BufferState::Streaming);

    // Healthy: batches stream straight through
    assert!(store.handle_messages(batch(&["s1", "s2"])).await.is_complete());
    assert_eq!(drain_payloads(&mut rx), vec!["s1", "s2"]);

    // Outage: the peer starts refusing
    healthy.store(false, Ordering::SeqCst);
    assert!(store.handle_messages(batch(&["o1"])).await.is_complete());
    assert_eq!(store.state(), BufferState::Disconnected);
    assert!(store.handle_messages(batch(&["o2", "o3"])).await.is_complete());

    // The pipeline keeps ticking during the outage without losing anything
    for _ in 0..6 {
        store.periodic_check().await;
    }
    assert_ne!(store.state(), BufferState::Streaming);
    assert!(drain_payloads(&mut rx).is_empty(), "nothing committed while down");

    // Recovery: ticks drain the backlog oldest-first, then streaming resumes
    healthy.store(true, Ordering::SeqCst);
    for _ in 0..8 {
        store.periodic_check().await;
        if store.state() == BufferState::Streaming {
            break;
        }
    }
    assert_eq!(store.state(), BufferState::Streaming);
    assert_eq!(drain_payloads(&mut rx), vec!["o1", "o2", "o3"]);

    // Post-recovery traffic streams again
    assert!(store.handle_messages(batch(&["s3"])).await.is_complete());
    assert_eq!(drain_payloads(&mut rx), vec!["s3"]);

    store.flush().await;
    store.close().await;
}
