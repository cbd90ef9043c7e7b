//! The store contract and the type-name factory.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sluice_conn::{ConnPool, NullResolver, ServiceResolver};
use sluice_protocol::MessageBatch;

use crate::bucket::BucketStore;
use crate::buffer::BufferStore;
use crate::category::CategoryStore;
use crate::common::Handled;
use crate::file::FileStore;
use crate::framed::FramedFileStore;
use crate::multi::MultiStore;
use crate::network::NetworkStore;
use crate::null::NullStore;
use crate::options::StoreOptions;

/// Process-wide collaborators injected into every store.
///
/// The connection pool and the resolver are the only state shared across
/// store chains; everything else is exclusively owned. Cloning a context is
/// cheap (two `Arc`s) and is how composites hand the collaborators down to
/// the children they build.
#[derive(Clone)]
pub struct StoreContext {
    /// Shared peer connection pool
    pub conn_pool: Arc<ConnPool>,

    /// Service-name resolution for network stores
    pub resolver: Arc<dyn ServiceResolver>,
}

impl StoreContext {
    /// Context with the given pool and no service discovery
    pub fn new(conn_pool: Arc<ConnPool>) -> Self {
        Self {
            conn_pool,
            resolver: Arc::new(NullResolver),
        }
    }

    /// Replace the resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl Default for StoreContext {
    fn default() -> Self {
        Self::new(Arc::new(ConnPool::new()))
    }
}

/// The uniform contract every sink and composite implements.
///
/// One worker drives one store chain, so every mutating operation takes
/// `&mut self`; no internal locking is needed on the hot path. Operations
/// may suspend for I/O but never block forever.
#[async_trait]
pub trait Store: Send {
    /// Category this instance is bound to
    fn category(&self) -> &str;

    /// Short type name (`"file"`, `"buffer"`, ...)
    fn store_type(&self) -> &'static str;

    /// True if this instance accepts entries of any category
    fn multi_category(&self) -> bool;

    /// Apply configuration. Unknown keys warn; unusable values are fatal to
    /// this instance and surface through `status` and a failing `open`.
    fn configure(&mut self, options: &StoreOptions);

    /// Acquire the underlying resource. Idempotent; returns success.
    async fn open(&mut self) -> bool;

    /// Non-blocking liveness check
    fn is_open(&self) -> bool;

    /// Release resources. Safe to call repeatedly.
    async fn close(&mut self);

    /// Attempt to commit the batch; see [`Handled`] for the contract.
    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled;

    /// Called by the owner at a regular cadence (about once a second).
    /// Rotates files, retries connections, drains buffers.
    async fn periodic_check(&mut self) {}

    /// Durably commit anything buffered internally
    async fn flush(&mut self);

    /// A new instance sharing this configuration, bound to `category`
    fn copy_for_category(&self, category: &str) -> Box<dyn Store>;

    /// Current health line; empty means healthy. Thread-safe.
    fn status(&self) -> String;
}

/// Queue capability for stores that can hand their contents back.
///
/// Only some stores are readable, so this is a capability separate from
/// [`Store`]. The `now` argument exists solely for the too-new-to-consume
/// safety rule: entries dated after `now` are never read or deleted.
#[async_trait]
pub trait Readable: Send {
    /// Read the oldest stored unit into a batch. An empty batch means
    /// nothing is available.
    async fn read_oldest(&mut self, now: DateTime<Local>) -> std::io::Result<MessageBatch>;

    /// Rewrite the oldest stored unit with `batch` (drops the already-sent
    /// prefix after a partial drain).
    async fn replace_oldest(
        &mut self,
        batch: MessageBatch,
        now: DateTime<Local>,
    ) -> std::io::Result<()>;

    /// Remove the oldest stored unit
    async fn delete_oldest(&mut self, now: DateTime<Local>) -> std::io::Result<()>;

    /// True when nothing is stored (as of `now`)
    async fn empty(&mut self, now: DateTime<Local>) -> bool;
}

/// A store that also exposes the queue capability
pub trait ReadableStore: Store + Readable {}

impl<T: Store + Readable> ReadableStore for T {}

/// Build a store by type name.
///
/// Returns `None` (with an error log) for unknown types; the caller treats
/// that as a configuration error.
pub fn create_store(
    ctx: &StoreContext,
    store_type: &str,
    category: &str,
    multi_category: bool,
) -> Option<Box<dyn Store>> {
    match store_type {
        "file" => Some(Box::new(FileStore::new(category, multi_category))),
        "framed_file" => Some(Box::new(FramedFileStore::new(category, multi_category))),
        "network" => Some(Box::new(NetworkStore::new(
            ctx.clone(),
            category,
            multi_category,
        ))),
        "buffer" => Some(Box::new(BufferStore::new(
            ctx.clone(),
            category,
            multi_category,
        ))),
        "multi" => Some(Box::new(MultiStore::new(
            ctx.clone(),
            category,
            multi_category,
        ))),
        "bucket" => Some(Box::new(BucketStore::new(
            ctx.clone(),
            category,
            multi_category,
        ))),
        "null" => Some(Box::new(NullStore::new(category, multi_category))),
        "multifile" => Some(Box::new(CategoryStore::multi_file(category, multi_category))),
        "framed_multifile" => Some(Box::new(CategoryStore::framed_multi_file(
            category,
            multi_category,
        ))),
        other => {
            tracing::error!(store_type = other, category, "unknown store type");
            None
        }
    }
}

/// Build a readable store by type name.
///
/// Only types with queue semantics qualify: a file store in buffer mode, or
/// the null store. Used for buffer-store secondaries.
pub fn create_readable_store(
    store_type: &str,
    category: &str,
    multi_category: bool,
) -> Option<Box<dyn ReadableStore>> {
    match store_type {
        "file" => Some(Box::new(FileStore::buffer_file(category, multi_category))),
        "null" => Some(Box::new(NullStore::new(category, multi_category))),
        other => {
            tracing::error!(store_type = other, category, "store type is not readable");
            None
        }
    }
}
