//! Network store - forwards batches to a peer server.
//!
//! A thin adapter over the shared connection pool (or a directly owned
//! connection when pooling is off). One RPC carries the whole batch; the
//! peer answers OK or TRY_AGAIN. Anything other than OK marks the store
//! not-open and hands the full batch back, so the owner (usually a buffer
//! store) can back off and buffer.

use std::time::Duration;

use async_trait::async_trait;
use sluice_conn::{PeerConnection, PoolHandle};
use sluice_protocol::{MessageBatch, SendStatus};

use crate::common::{Handled, StatusLine, StoreCounters};
use crate::options::StoreOptions;
use crate::store::{Store, StoreContext};

const DEFAULT_TIMEOUT_MS: u64 = 5000;

const RECOGNIZED: &[&str] = &[
    "remote_host",
    "remote_port",
    "timeout_ms",
    "use_conn_pool",
    "service_based",
    "service_name",
];

enum Conn {
    Closed,
    Direct(PeerConnection),
    Pooled(PoolHandle),
}

/// Store that forwards batches to another sluice server
pub struct NetworkStore {
    ctx: StoreContext,
    category: String,
    multi: bool,

    // configuration
    remote_host: String,
    remote_port: u16,
    timeout: Duration,
    use_conn_pool: bool,
    service_based: bool,
    service_name: String,
    config_error: Option<String>,

    // state
    conn: Conn,
    status: StatusLine,
    counters: StoreCounters,
}

impl NetworkStore {
    /// Create a network store for a category
    pub fn new(ctx: StoreContext, category: &str, multi_category: bool) -> Self {
        Self {
            ctx,
            category: category.to_string(),
            multi: multi_category,
            remote_host: String::new(),
            remote_port: 0,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            use_conn_pool: false,
            service_based: false,
            service_name: String::new(),
            config_error: None,
            conn: Conn::Closed,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        }
    }

    /// Resolve the peer endpoint for this store
    fn endpoint(&self) -> Option<(String, u16)> {
        if self.service_based {
            let endpoints = self.ctx.resolver.resolve(&self.service_name);
            if endpoints.is_empty() {
                tracing::warn!(
                    category = %self.category,
                    service = %self.service_name,
                    "service resolved to no endpoints"
                );
            }
            endpoints.into_iter().next()
        } else {
            Some((self.remote_host.clone(), self.remote_port))
        }
    }

    async fn drop_connection(&mut self) {
        match std::mem::replace(&mut self.conn, Conn::Closed) {
            Conn::Closed | Conn::Direct(_) => {}
            Conn::Pooled(handle) => self.ctx.conn_pool.release(handle).await,
        }
    }
}

#[async_trait]
impl Store for NetworkStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        "network"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        if let Some(host) = options.get_str("remote_host") {
            self.remote_host = host;
        }
        if let Some(port) = options.get_u64("remote_port") {
            if port == 0 || port > u16::MAX as u64 {
                self.config_error = Some(format!("remote_port {port} out of range"));
            } else {
                self.remote_port = port as u16;
            }
        }
        if let Some(ms) = options.get_u64("timeout_ms") {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(pool) = options.get_bool("use_conn_pool") {
            self.use_conn_pool = pool;
        }
        if let Some(service) = options.get_bool("service_based") {
            self.service_based = service;
        }
        if let Some(name) = options.get_str("service_name") {
            self.service_name = name;
        }

        if self.service_based {
            if self.service_name.is_empty() {
                self.config_error = Some("service_based requires service_name".into());
            }
        } else if self.remote_host.is_empty() || self.remote_port == 0 {
            self.config_error = Some("remote_host and remote_port are required".into());
        }
        if let Some(message) = &self.config_error {
            self.status.set(format!("misconfigured: {message}"));
            tracing::error!(
                category = %self.category,
                error = %message,
                "network store misconfigured"
            );
        }

        options.warn_unknown(RECOGNIZED, self.store_type(), &self.category);
    }

    async fn open(&mut self) -> bool {
        if self.is_open() {
            return true;
        }
        if self.config_error.is_some() {
            return false;
        }
        let Some((host, port)) = self.endpoint() else {
            self.status.set("no endpoint available");
            return false;
        };

        let opened = if self.use_conn_pool {
            match self.ctx.conn_pool.acquire(&host, port, self.timeout).await {
                Ok(handle) => {
                    self.conn = Conn::Pooled(handle);
                    true
                }
                Err(e) => {
                    self.status.set(format!("connect failed: {e}"));
                    tracing::warn!(
                        category = %self.category,
                        addr = format!("{host}:{port}"),
                        error = %e,
                        "pooled connect failed"
                    );
                    false
                }
            }
        } else {
            match PeerConnection::connect(&host, port, self.timeout).await {
                Ok(conn) => {
                    self.conn = Conn::Direct(conn);
                    true
                }
                Err(e) => {
                    self.status.set(format!("connect failed: {e}"));
                    tracing::warn!(
                        category = %self.category,
                        addr = format!("{host}:{port}"),
                        error = %e,
                        "connect failed"
                    );
                    false
                }
            }
        };

        if opened {
            self.status.clear();
            tracing::info!(
                category = %self.category,
                addr = format!("{host}:{port}"),
                pooled = self.use_conn_pool,
                "network store open"
            );
        }
        opened
    }

    fn is_open(&self) -> bool {
        !matches!(self.conn, Conn::Closed)
    }

    async fn close(&mut self) {
        self.drop_connection().await;
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        if batch.is_empty() {
            return Handled::Complete;
        }
        self.counters.record_received(batch.len() as u64);

        if !self.is_open() && !self.open().await {
            return Handled::Residual(batch);
        }

        let result = match &mut self.conn {
            Conn::Direct(conn) => conn.send(&batch).await,
            Conn::Pooled(handle) => handle.send(&batch).await,
            Conn::Closed => {
                return Handled::Residual(batch);
            }
        };

        match result {
            Ok(SendStatus::Ok) => {
                self.counters.record_committed(batch.len() as u64);
                self.status.clear();
                Handled::Complete
            }
            Ok(SendStatus::TryAgain) => {
                self.status.set("peer asked to try again later");
                tracing::warn!(
                    category = %self.category,
                    count = batch.len(),
                    "peer rejected batch with try-again"
                );
                self.drop_connection().await;
                Handled::Residual(batch)
            }
            Err(e) => {
                self.status.set(format!("send failed: {e}"));
                tracing::warn!(
                    category = %self.category,
                    count = batch.len(),
                    error = %e,
                    "send to peer failed"
                );
                self.drop_connection().await;
                Handled::Residual(batch)
            }
        }
    }

    async fn flush(&mut self) {}

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        let mut copy = NetworkStore::new(self.ctx.clone(), category, self.multi);
        copy.remote_host = self.remote_host.clone();
        copy.remote_port = self.remote_port;
        copy.timeout = self.timeout;
        copy.use_conn_pool = self.use_conn_pool;
        copy.service_based = self.service_based;
        copy.service_name = self.service_name.clone();
        copy.config_error = self.config_error.clone();
        Box::new(copy)
    }

    fn status(&self) -> String {
        self.status.get()
    }
}

#[cfg(test)]
#[path = "network_test.rs"]
mod network_test;
