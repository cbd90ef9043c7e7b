//! Null store - discards everything.
//!
//! Routing a category here is how operators explicitly drop traffic. The
//! store is readable so it can stand in as a buffer-store secondary in
//! configurations that accept loss during outages: reads always come back
//! empty.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sluice_protocol::MessageBatch;

use crate::common::{Handled, StatusLine, StoreCounters};
use crate::options::StoreOptions;
use crate::store::{Readable, Store};

/// Store that accepts and discards every batch
pub struct NullStore {
    category: String,
    multi: bool,
    open: bool,
    status: StatusLine,
    counters: StoreCounters,
}

impl NullStore {
    /// Create a null store for a category
    pub fn new(category: &str, multi_category: bool) -> Self {
        Self {
            category: category.to_string(),
            multi: multi_category,
            open: false,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        }
    }

    /// Messages discarded so far
    pub fn discarded(&self) -> u64 {
        self.counters.snapshot().received
    }
}

#[async_trait]
impl Store for NullStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        "null"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, _options: &StoreOptions) {}

    async fn open(&mut self) -> bool {
        self.open = true;
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.open = false;
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        self.counters.record_received(batch.len() as u64);
        tracing::trace!(
            category = %self.category,
            count = batch.len(),
            "discarding batch"
        );
        Handled::Complete
    }

    async fn flush(&mut self) {}

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        Box::new(NullStore::new(category, self.multi))
    }

    fn status(&self) -> String {
        self.status.get()
    }
}

#[async_trait]
impl Readable for NullStore {
    async fn read_oldest(&mut self, _now: DateTime<Local>) -> std::io::Result<MessageBatch> {
        Ok(MessageBatch::new())
    }

    async fn replace_oldest(
        &mut self,
        _batch: MessageBatch,
        _now: DateTime<Local>,
    ) -> std::io::Result<()> {
        Ok(())
    }

    async fn delete_oldest(&mut self, _now: DateTime<Local>) -> std::io::Result<()> {
        Ok(())
    }

    async fn empty(&mut self, _now: DateTime<Local>) -> bool {
        true
    }
}
