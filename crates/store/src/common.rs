//! Common types shared by all stores.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_protocol::MessageBatch;
use thiserror::Error;

/// Outcome of one `handle_messages` call.
///
/// The residual is always a *suffix* of the submitted batch: everything
/// before it has been committed (or intentionally discarded by policy), and
/// the caller re-submits only the residual.
#[derive(Debug)]
pub enum Handled {
    /// Entire batch committed
    Complete,

    /// The suffix that was not committed
    Residual(MessageBatch),
}

impl Handled {
    /// True if the whole batch was committed
    pub fn is_complete(&self) -> bool {
        matches!(self, Handled::Complete)
    }

    /// The residual batch; empty when complete
    pub fn into_residual(self) -> MessageBatch {
        match self {
            Handled::Complete => MessageBatch::new(),
            Handled::Residual(batch) => batch,
        }
    }
}

/// Errors raised on internal store seams (open, rotation, reads).
///
/// Delivery failures never surface as errors; they come back through
/// `Handled::Residual` and the status line.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unusable configuration; fatal for this store instance
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires an open store
    #[error("store is not open")]
    NotOpen,
}

/// A store's health line.
///
/// Empty means healthy. The line lives behind its own mutex so that a
/// monitoring thread can read it while the owning worker is mid-write; the
/// lock is never held across any other lock or any I/O.
#[derive(Debug, Clone, Default)]
pub struct StatusLine {
    line: Arc<Mutex<String>>,
}

impl StatusLine {
    /// New, healthy status
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the status line
    pub fn set(&self, line: impl Into<String>) {
        *self.line.lock() = line.into();
    }

    /// Mark healthy
    pub fn clear(&self) {
        self.line.lock().clear();
    }

    /// Current line; empty means healthy
    pub fn get(&self) -> String {
        self.line.lock().clone()
    }

    /// True when the status line is empty
    pub fn is_healthy(&self) -> bool {
        self.line.lock().is_empty()
    }
}

/// Message counters kept by leaf stores
#[derive(Debug, Default)]
pub struct StoreCounters {
    /// Messages offered to this store
    pub received: AtomicU64,

    /// Messages committed downstream
    pub committed: AtomicU64,

    /// Messages dropped by policy (overflow only)
    pub dropped: AtomicU64,
}

impl StoreCounters {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_committed(&self, n: u64) {
        self.committed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time view of the counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`StoreCounters`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub received: u64,
    pub committed: u64,
    pub dropped: u64,
}
