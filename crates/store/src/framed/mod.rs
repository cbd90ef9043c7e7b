//! Framed file store - rotating files of varint-length-prefixed records.
//!
//! Shares the rotation engine with the plain file store but writes through
//! a buffered record transport instead of newline framing, which makes it
//! safe for payloads that may contain newlines. Not readable; framed files
//! feed downstream batch consumers, not the buffer-store drain.

mod transport;

use std::fs;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use sluice_protocol::{LogEntry, MessageBatch};
use std::time::Duration;

use crate::common::{Handled, StatusLine, StoreCounters, StoreError};
use crate::file::base::{FileStoreBase, BASE_RECOGNIZED};
use crate::options::StoreOptions;
use crate::store::Store;

pub use transport::FramedReader;
use transport::{varint_len, FramedTransport};

const DEFAULT_FLUSH_FREQUENCY_MS: u64 = 3000;
const DEFAULT_MSG_BUFFER_SIZE: u64 = 1024 * 1024;

/// Serialize one entry as a framed record payload
fn encode_payload(entry: &LogEntry, write_category: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entry.category.len() + entry.message.len() + 1);
    if write_category {
        buf.extend_from_slice(entry.category.as_bytes());
        buf.push(b'\t');
    }
    buf.extend_from_slice(&entry.message);
    buf
}

/// Rotating sink of varint-framed records
pub struct FramedFileStore {
    base: FileStoreBase,
    multi: bool,
    flush_frequency: Duration,
    msg_buffer_size: usize,
    transport: Option<FramedTransport>,
    status: StatusLine,
    counters: StoreCounters,
}

impl FramedFileStore {
    /// Create a framed file store for a category
    pub fn new(category: &str, multi_category: bool) -> Self {
        let mut base = FileStoreBase::new(category);
        // Record boundaries carry the length; category tags only matter for
        // multi-category instances.
        base.write_category = multi_category;
        Self {
            base,
            multi: multi_category,
            flush_frequency: Duration::from_millis(DEFAULT_FLUSH_FREQUENCY_MS),
            msg_buffer_size: DEFAULT_MSG_BUFFER_SIZE as usize,
            transport: None,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        }
    }

    fn open_internal(&mut self, increment: bool, now: DateTime<Local>) -> Result<(), StoreError> {
        if let Some(message) = &self.base.config_error {
            self.status.set(format!("misconfigured: {message}"));
            return Err(StoreError::Config(message.clone()));
        }

        let date = now.date_naive();
        fs::create_dir_all(&self.base.file_path)?;

        let suffix = match (self.base.find_newest_suffix(date)?, increment) {
            (Some(newest), true) => newest + 1,
            (Some(newest), false) => newest,
            (None, _) => 0,
        };
        let path = self.base.full_filename(date, suffix);

        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let existing = file.metadata()?.len();
        let transport = FramedTransport::new(file, self.msg_buffer_size, self.flush_frequency);

        // New transport is live; retire the old one
        if let Some(old) = self.transport.take() {
            if let Err(e) = old.finish() {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "flush of rotated file failed"
                );
            }
            if let Some(old_path) = self.base.current_path.clone() {
                self.base
                    .record_stats(&old_path, self.base.current_size, self.base.events_written);
            }
        }

        self.base.register_open(path.clone(), date, suffix, existing, now);
        self.transport = Some(transport);

        if self.base.create_symlink {
            if let Err(e) = self.base.update_symlink(&path) {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "failed to update current symlink"
                );
            }
        }

        self.status.clear();
        tracing::info!(
            category = %self.base.category,
            path = %path.display(),
            "opened framed file"
        );
        Ok(())
    }
}

#[async_trait]
impl Store for FramedFileStore {
    fn category(&self) -> &str {
        &self.base.category
    }

    fn store_type(&self) -> &'static str {
        "framed_file"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        self.base.configure(options);
        if let Some(freq) = options.get_u64("flush_frequency_ms") {
            self.flush_frequency = Duration::from_millis(freq);
        }
        if let Some(size) = options.get_u64("msg_buffer_size") {
            self.msg_buffer_size = size as usize;
        }
        if let Some(message) = &self.base.config_error {
            self.status.set(format!("misconfigured: {message}"));
        }

        let mut recognized = BASE_RECOGNIZED.to_vec();
        recognized.extend_from_slice(&["flush_frequency_ms", "msg_buffer_size"]);
        options.warn_unknown(&recognized, self.store_type(), &self.base.category);
    }

    async fn open(&mut self) -> bool {
        if self.transport.is_some() {
            return true;
        }
        match self.open_internal(false, Local::now()) {
            Ok(()) => true,
            Err(e) => {
                self.status.set(format!("open failed: {e}"));
                tracing::error!(
                    category = %self.base.category,
                    error = %e,
                    "failed to open framed file store"
                );
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    async fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.finish() {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "flush on close failed"
                );
            }
        }
        self.base.reset_current();
    }

    async fn handle_messages(&mut self, mut batch: MessageBatch) -> Handled {
        if batch.is_empty() {
            return Handled::Complete;
        }
        self.counters.record_received(batch.len() as u64);
        let now = Local::now();

        if self.transport.is_none() {
            if let Err(e) = self.open_internal(false, now) {
                self.status.set(format!("open failed: {e}"));
                return Handled::Residual(batch);
            }
        }
        if self.base.rotation_due(now) {
            if let Err(e) = self.open_internal(true, now) {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "rotation failed; continuing on current file"
                );
            }
        }

        for index in 0..batch.len() {
            let payload = encode_payload(&batch[index], self.base.write_category);
            let record_len = varint_len(payload.len() as u64) as u64 + payload.len() as u64;

            if self.base.write_would_overflow(record_len) {
                if let Err(e) = self.open_internal(true, now) {
                    tracing::warn!(
                        category = %self.base.category,
                        error = %e,
                        "size rotation failed; continuing on current file"
                    );
                }
            }

            let write = match self.transport.as_mut() {
                Some(transport) => transport.write_record(&payload),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "file not open",
                )),
            };
            match write {
                Ok(written) => self.base.register_write(written as u64, 1),
                Err(e) => {
                    self.status.set(format!("write failed: {e}"));
                    tracing::error!(
                        category = %self.base.category,
                        error = %e,
                        written = index,
                        "batch write failed"
                    );
                    return Handled::Residual(batch.split_off(index));
                }
            }
        }

        self.counters.record_committed(batch.len() as u64);
        self.status.clear();
        Handled::Complete
    }

    async fn periodic_check(&mut self) {
        let now = Local::now();
        if self.transport.is_some() && self.base.rotation_due(now) {
            if let Err(e) = self.open_internal(true, now) {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "scheduled rotation failed"
                );
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.maybe_flush() {
                self.status.set(format!("flush failed: {e}"));
            }
        }
    }

    async fn flush(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.flush() {
                self.status.set(format!("flush failed: {e}"));
                tracing::error!(
                    category = %self.base.category,
                    error = %e,
                    "durable flush failed"
                );
            }
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        Box::new(FramedFileStore {
            base: self.base.copy_for(category),
            multi: self.multi,
            flush_frequency: self.flush_frequency,
            msg_buffer_size: self.msg_buffer_size,
            transport: None,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        })
    }

    fn status(&self) -> String {
        self.status.get()
    }
}
