use super::*;

use std::sync::Arc;

use sluice_conn::StaticResolver;
use sluice_protocol::{wire, LogEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Fake peer that answers every batch with a fixed status and streams the
/// decoded batches out on a channel. Serves any number of connections.
async fn spawn_peer(
    status: SendStatus,
) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<MessageBatch>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let tx = tx.clone();
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
                    let batch = wire::decode_batch(&frame).expect("bad frame");
                    let _ = tx.send(batch);
                    if stream.write_all(&[status.as_byte()]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, rx)
}

fn store_for(addr: std::net::SocketAddr, ctx: StoreContext) -> NetworkStore {
    let mut store = NetworkStore::new(ctx, "web", false);
    store.configure(
        &StoreOptions::new()
            .with_str("remote_host", addr.ip().to_string())
            .with_int("remote_port", addr.port() as i64)
            .with_int("timeout_ms", 1000),
    );
    store
}

fn batch(payloads: &[&str]) -> MessageBatch {
    payloads
        .iter()
        .map(|p| LogEntry::new("web", p.as_bytes().to_vec()))
        .collect()
}

#[tokio::test]
async fn delivers_batches_in_order() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;
    let mut store = store_for(addr, StoreContext::default());

    assert!(store.open().await, "open failed: {}", store.status());
    assert!(store.is_open());

    assert!(store.handle_messages(batch(&["one", "two"])).await.is_complete());
    assert!(store.handle_messages(batch(&["three"])).await.is_complete());

    let first = rx.recv().await.expect("first batch");
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].message.as_ref(), b"one");
    assert_eq!(first[1].message.as_ref(), b"two");
    let second = rx.recv().await.expect("second batch");
    assert_eq!(second[0].message.as_ref(), b"three");
}

#[tokio::test]
async fn try_again_returns_full_residual_and_closes() {
    let (addr, _rx) = spawn_peer(SendStatus::TryAgain).await;
    let mut store = store_for(addr, StoreContext::default());
    assert!(store.open().await);

    let submitted = batch(&["a", "b", "c"]);
    let result = store.handle_messages(submitted.clone()).await;

    assert_eq!(result.into_residual(), submitted);
    assert!(!store.is_open(), "try-again must mark the store closed");
    assert!(!store.status().is_empty());
}

#[tokio::test]
async fn unreachable_peer_fails_open_and_returns_batch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no addr");
    drop(listener);

    let mut store = store_for(addr, StoreContext::default());
    assert!(!store.open().await);
    assert!(!store.status().is_empty());

    let submitted = batch(&["x"]);
    let result = store.handle_messages(submitted.clone()).await;
    assert_eq!(result.into_residual(), submitted);
}

#[tokio::test]
async fn handle_messages_reopens_lazily() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;
    let mut store = store_for(addr, StoreContext::default());

    // Never explicitly opened; the first batch opens the connection
    assert!(store.handle_messages(batch(&["lazy"])).await.is_complete());
    assert!(store.is_open());
    assert_eq!(rx.recv().await.expect("batch")[0].message.as_ref(), b"lazy");
}

#[tokio::test]
async fn pooled_stores_share_one_connection() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;
    let ctx = StoreContext::default();

    let options = StoreOptions::new()
        .with_str("remote_host", addr.ip().to_string())
        .with_int("remote_port", addr.port() as i64)
        .with_bool("use_conn_pool", true)
        .with_int("timeout_ms", 1000);

    let mut store_a = NetworkStore::new(ctx.clone(), "web", false);
    store_a.configure(&options);
    let mut store_b = NetworkStore::new(ctx.clone(), "db", false);
    store_b.configure(&options);

    assert!(store_a.open().await);
    assert!(store_b.open().await);
    assert_eq!(ctx.conn_pool.open_peers().await, 1);

    assert!(store_a.handle_messages(batch(&["from a"])).await.is_complete());
    assert!(store_b
        .handle_messages(vec![LogEntry::new("db", &b"from b"[..])])
        .await
        .is_complete());
    assert_eq!(rx.recv().await.expect("a")[0].message.as_ref(), b"from a");
    assert_eq!(rx.recv().await.expect("b")[0].message.as_ref(), b"from b");

    store_a.close().await;
    assert_eq!(ctx.conn_pool.open_peers().await, 1, "b still leases it");
    store_b.close().await;
    assert_eq!(ctx.conn_pool.open_peers().await, 0);
}

#[tokio::test]
async fn service_based_resolution() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;

    let resolver = Arc::new(StaticResolver::new());
    resolver.register("aggregator", vec![(addr.ip().to_string(), addr.port())]);
    let ctx = StoreContext::default().with_resolver(resolver);

    let mut store = NetworkStore::new(ctx, "web", false);
    store.configure(
        &StoreOptions::new()
            .with_bool("service_based", true)
            .with_str("service_name", "aggregator")
            .with_int("timeout_ms", 1000),
    );

    assert!(store.open().await, "open failed: {}", store.status());
    assert!(store.handle_messages(batch(&["via service"])).await.is_complete());
    assert_eq!(
        rx.recv().await.expect("batch")[0].message.as_ref(),
        b"via service"
    );
}

#[tokio::test]
async fn unresolvable_service_fails_open() {
    let ctx = StoreContext::default();
    let mut store = NetworkStore::new(ctx, "web", false);
    store.configure(
        &StoreOptions::new()
            .with_bool("service_based", true)
            .with_str("service_name", "ghost"),
    );

    assert!(!store.open().await);
    assert!(!store.status().is_empty());
}

#[tokio::test]
async fn missing_endpoint_is_a_config_error() {
    let mut store = NetworkStore::new(StoreContext::default(), "web", false);
    store.configure(&StoreOptions::new());
    assert!(!store.open().await);
    assert!(store.status().contains("misconfigured"));
}

#[tokio::test]
async fn copy_for_category_keeps_the_peer() {
    let (addr, mut rx) = spawn_peer(SendStatus::Ok).await;
    let store = store_for(addr, StoreContext::default());

    let mut copy = store.copy_for_category("db");
    assert_eq!(copy.category(), "db");
    assert!(copy.open().await);
    assert!(copy
        .handle_messages(vec![LogEntry::new("db", &b"copied"[..])])
        .await
        .is_complete());
    assert_eq!(rx.recv().await.expect("batch")[0].category, "db");
}
