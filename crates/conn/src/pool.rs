//! Shared connection pool.
//!
//! One pool instance is created per process and handed to every network
//! store as an `Arc`. Connections are keyed by `host:port` and
//! reference-counted: the first acquire opens the connection, later acquires
//! share it, and the last release closes it. Sends through a shared peer are
//! serialized by a per-peer mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sluice_protocol::{LogEntry, SendStatus};
use tokio::sync::Mutex;

use crate::peer::{ConnError, PeerConnection};

struct PooledPeer {
    host: String,
    port: u16,
    timeout: Duration,
    refs: AtomicUsize,
    conn: Mutex<Option<PeerConnection>>,
}

impl PooledPeer {
    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A store's lease on a pooled peer connection.
///
/// Handles are cheap to clone-free move around but must be returned with
/// [`ConnPool::release`]; the pool does not track drops.
pub struct PoolHandle {
    peer: Arc<PooledPeer>,
}

impl PoolHandle {
    /// Peer address as `host:port`
    pub fn addr(&self) -> String {
        self.peer.key()
    }

    /// Send one batch through the shared connection.
    ///
    /// Reconnects if a previous sender invalidated the connection. On any
    /// error the connection is dropped so the next sender starts clean.
    pub async fn send(&self, batch: &[LogEntry]) -> Result<SendStatus, ConnError> {
        let mut conn = self.peer.conn.lock().await;

        let mut peer_conn = match conn.take() {
            Some(existing) => existing,
            None => {
                PeerConnection::connect(&self.peer.host, self.peer.port, self.peer.timeout).await?
            }
        };

        let result = peer_conn.send(batch).await;
        if result.is_ok() {
            *conn = Some(peer_conn);
        }
        result
    }
}

/// Process-wide pool of peer connections.
pub struct ConnPool {
    peers: Mutex<HashMap<String, Arc<PooledPeer>>>,
}

impl ConnPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a lease on the connection to `host:port`, opening it if this
    /// is the first lease.
    pub async fn acquire(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<PoolHandle, ConnError> {
        let key = format!("{}:{}", host, port);

        let peer = {
            let mut peers = self.peers.lock().await;
            Arc::clone(peers.entry(key).or_insert_with(|| {
                Arc::new(PooledPeer {
                    host: host.to_string(),
                    port,
                    timeout,
                    refs: AtomicUsize::new(0),
                    conn: Mutex::new(None),
                })
            }))
        };

        // Open eagerly so acquire reports connectivity problems
        {
            let mut conn = peer.conn.lock().await;
            if conn.is_none() {
                match PeerConnection::connect(&peer.host, peer.port, peer.timeout).await {
                    Ok(new_conn) => *conn = Some(new_conn),
                    Err(e) => {
                        drop(conn);
                        let mut peers = self.peers.lock().await;
                        if peer.refs.load(Ordering::SeqCst) == 0 {
                            peers.remove(&peer.key());
                        }
                        return Err(e);
                    }
                }
            }
        }

        peer.refs.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            addr = %peer.key(),
            refs = peer.refs.load(Ordering::SeqCst),
            "pool lease acquired"
        );

        Ok(PoolHandle { peer })
    }

    /// Return a lease. The underlying connection closes when the last lease
    /// is returned.
    pub async fn release(&self, handle: PoolHandle) {
        let peer = handle.peer;
        let remaining = peer.refs.fetch_sub(1, Ordering::SeqCst) - 1;

        if remaining == 0 {
            let mut peers = self.peers.lock().await;
            // Re-check under the map lock; a concurrent acquire may have
            // taken a fresh lease.
            if peer.refs.load(Ordering::SeqCst) == 0 {
                peers.remove(&peer.key());
                *peer.conn.lock().await = None;
                tracing::debug!(addr = %peer.key(), "pool connection closed");
            }
        }
    }

    /// Number of peers currently held open
    pub async fn open_peers(&self) -> usize {
        self.peers.lock().await.len()
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
