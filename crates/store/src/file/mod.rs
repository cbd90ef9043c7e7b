//! File store - rotating plain files, and the disk queue behind buffer
//! stores.
//!
//! # On-Disk Format
//!
//! Each record is `[category "\t"] payload ["\n"]`; the category prefix is
//! written when the store is category-tagged (multi-category buffer files),
//! the newline when `add_newlines` is set. With `write_meta` a one-line
//! header records the chunk size when a file is first created. Chunk padding
//! bytes are NUL and always sit between records.
//!
//! # Buffer Mode
//!
//! With `is_buffer_file` the store is a disk queue: every enqueued batch
//! gets its own suffix file, and the `Readable` capability hands files back
//! oldest-first. The currently open write target is never consumed — if the
//! oldest file is the write target, the store rotates first so the read
//! sees a closed file.

pub(crate) mod base;

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use sluice_protocol::{LogEntry, MessageBatch};

use crate::common::{Handled, StatusLine, StoreCounters, StoreError};
use crate::options::StoreOptions;
use crate::store::{Readable, Store};

pub use base::RollPeriod;
use base::{FileStoreBase, BASE_RECOGNIZED};

const META_HEADER_PREFIX: &str = "<scribe_meta><chunk_size>";
const META_HEADER_SUFFIX: &str = "</chunk_size></scribe_meta>\n";

fn meta_header(chunk_size: u64) -> String {
    format!("{META_HEADER_PREFIX}{chunk_size}{META_HEADER_SUFFIX}")
}

/// Serialize one entry in the file record format.
fn encode_entry(entry: &LogEntry, write_category: bool, add_newline: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entry.category.len() + entry.message.len() + 2);
    if write_category {
        buf.extend_from_slice(entry.category.as_bytes());
        buf.push(b'\t');
    }
    buf.extend_from_slice(&entry.message);
    if add_newline {
        buf.push(b'\n');
    }
    buf
}

/// Decode a whole data file back into entries. Skips the metadata header
/// and NUL padding runs; tolerant of a torn final record (no trailing
/// newline) so a crash mid-write never poisons the file.
fn decode_entries(bytes: &[u8], has_category: bool, default_category: &str) -> MessageBatch {
    let mut batch = MessageBatch::new();
    for segment in bytes.split(|&b| b == b'\n') {
        let start = segment
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(segment.len());
        let record = &segment[start..];
        if record.is_empty() || record.starts_with(META_HEADER_PREFIX.as_bytes()) {
            continue;
        }
        let (category, message) = if has_category {
            match record.iter().position(|&b| b == b'\t') {
                Some(pos) => (
                    String::from_utf8_lossy(&record[..pos]).into_owned(),
                    &record[pos + 1..],
                ),
                None => (default_category.to_string(), record),
            }
        } else {
            (default_category.to_string(), record)
        };
        batch.push(LogEntry {
            category,
            message: Bytes::copy_from_slice(message),
        });
    }
    batch
}

fn store_err_to_io(e: StoreError) -> io::Error {
    match e {
        StoreError::Io(io) => io,
        other => io::Error::other(other.to_string()),
    }
}

/// Rotating plain-file sink; a readable disk queue in buffer mode
pub struct FileStore {
    base: FileStoreBase,
    multi: bool,
    is_buffer_file: bool,
    add_newlines: bool,
    writer: Option<BufWriter<fs::File>>,
    status: StatusLine,
    counters: StoreCounters,
}

impl FileStore {
    /// Create a file store for a category
    pub fn new(category: &str, multi_category: bool) -> Self {
        Self {
            base: FileStoreBase::new(category),
            multi: multi_category,
            is_buffer_file: false,
            add_newlines: false,
            writer: None,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        }
    }

    /// Create a file store in buffer (disk queue) mode.
    ///
    /// Queue files are always newline-framed, carry no metadata header, and
    /// are category-tagged when the owner handles multiple categories so a
    /// drain can restore each entry's category.
    pub fn buffer_file(category: &str, multi_category: bool) -> Self {
        let mut store = Self::new(category, multi_category);
        store.is_buffer_file = true;
        store.add_newlines = true;
        store.base.write_category = multi_category;
        store
    }

    /// Path of the currently open data file, if any
    pub fn current_path(&self) -> Option<&Path> {
        self.base.current_path.as_deref()
    }

    /// Open (or reopen) the write target. With `increment` the next suffix
    /// is used; otherwise the newest existing file is appended to. On
    /// failure the previously open file stays open and writable.
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
        let mut writer = BufWriter::new(file);

        let mut size = existing;
        if self.base.write_meta && existing == 0 {
            let header = meta_header(self.base.chunk_size);
            writer.write_all(header.as_bytes())?;
            size += header.len() as u64;
        }

        // The new file is live; finalize the old one.
        if let Some(mut old) = self.writer.take() {
            if let Err(e) = old.flush() {
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

        self.base.register_open(path.clone(), date, suffix, size, now);
        self.writer = Some(writer);

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
            "opened data file"
        );
        Ok(())
    }

    fn write_record(&mut self, pad: u64, encoded: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file not open"))?;
        const ZEROS: [u8; 256] = [0u8; 256];
        let mut remaining = pad as usize;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            writer.write_all(&ZEROS[..n])?;
            remaining -= n;
        }
        writer.write_all(encoded)
    }

    /// Close the writer without recording stats (used before deleting the
    /// file out from under it).
    fn drop_writer(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
        self.base.reset_current();
    }
}

#[async_trait]
impl Store for FileStore {
    fn category(&self) -> &str {
        &self.base.category
    }

    fn store_type(&self) -> &'static str {
        "file"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        self.base.configure(options);
        if let Some(newlines) = options.get_bool("add_newlines") {
            self.add_newlines = newlines;
        }
        if let Some(buffer) = options.get_bool("is_buffer_file") {
            self.is_buffer_file = buffer;
        }
        if self.is_buffer_file {
            // Queue files must stay parseable and carry no header overhead
            self.add_newlines = true;
            self.base.write_meta = false;
        }
        if let Some(message) = &self.base.config_error {
            self.status.set(format!("misconfigured: {message}"));
        }

        let mut recognized = BASE_RECOGNIZED.to_vec();
        recognized.extend_from_slice(&["add_newlines", "is_buffer_file"]);
        options.warn_unknown(&recognized, self.store_type(), &self.base.category);
    }

    async fn open(&mut self) -> bool {
        if self.writer.is_some() {
            return true;
        }
        match self.open_internal(false, Local::now()) {
            Ok(()) => true,
            Err(e) => {
                self.status.set(format!("open failed: {e}"));
                tracing::error!(
                    category = %self.base.category,
                    error = %e,
                    "failed to open file store"
                );
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn close(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        if let Err(e) = writer.flush() {
            tracing::warn!(
                category = %self.base.category,
                error = %e,
                "flush on close failed"
            );
        }
        drop(writer);

        // An untouched queue file is noise for the drain scan
        if self.is_buffer_file && self.base.current_size == 0 {
            if let Some(path) = self.base.current_path.clone() {
                let _ = fs::remove_file(&path);
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

        if self.writer.is_none() {
            if let Err(e) = self.open_internal(false, now) {
                self.status.set(format!("open failed: {e}"));
                return Handled::Residual(batch);
            }
        }

        if self.is_buffer_file {
            // One enqueued batch per queue file
            if self.base.current_size > 0 {
                if let Err(e) = self.open_internal(true, now) {
                    self.status.set(format!("rotation failed: {e}"));
                    return Handled::Residual(batch);
                }
            }
        } else if self.base.rotation_due(now) {
            if let Err(e) = self.open_internal(true, now) {
                // Keep writing to the previous file; no data is at risk
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "rotation failed; continuing on current file"
                );
            }
        }

        for index in 0..batch.len() {
            let encoded = encode_entry(&batch[index], self.base.write_category, self.add_newlines);

            if !self.is_buffer_file && self.base.write_would_overflow(encoded.len() as u64) {
                if let Err(e) = self.open_internal(true, now) {
                    tracing::warn!(
                        category = %self.base.category,
                        error = %e,
                        "size rotation failed; continuing on current file"
                    );
                }
            }

            let pad = FileStoreBase::bytes_to_pad(
                encoded.len() as u64,
                self.base.current_size,
                self.base.chunk_size,
            );
            if let Err(e) = self.write_record(pad, &encoded) {
                self.status.set(format!("write failed: {e}"));
                tracing::error!(
                    category = %self.base.category,
                    error = %e,
                    written = index,
                    "batch write failed"
                );
                return Handled::Residual(batch.split_off(index));
            }
            self.base.register_write(pad + encoded.len() as u64, 1);
        }

        if self.is_buffer_file {
            // Queue entries must reach the kernel before we acknowledge
            if let Some(writer) = self.writer.as_mut() {
                if let Err(e) = writer.flush() {
                    self.status.set(format!("flush failed: {e}"));
                    return Handled::Residual(batch);
                }
            }
        }

        self.counters.record_committed(batch.len() as u64);
        self.status.clear();
        Handled::Complete
    }

    async fn periodic_check(&mut self) {
        let now = Local::now();
        if self.writer.is_some() && !self.is_buffer_file && self.base.rotation_due(now) {
            if let Err(e) = self.open_internal(true, now) {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "scheduled rotation failed"
                );
            }
        }
    }

    async fn flush(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writer
            .flush()
            .and_then(|()| writer.get_ref().sync_all());
        if let Err(e) = result {
            self.status.set(format!("flush failed: {e}"));
            tracing::error!(
                category = %self.base.category,
                error = %e,
                "durable flush failed"
            );
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        Box::new(FileStore {
            base: self.base.copy_for(category),
            multi: self.multi,
            is_buffer_file: self.is_buffer_file,
            add_newlines: self.add_newlines,
            writer: None,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        })
    }

    fn status(&self) -> String {
        self.status.get()
    }
}

#[async_trait]
impl Readable for FileStore {
    async fn read_oldest(&mut self, now: DateTime<Local>) -> io::Result<MessageBatch> {
        let Some((_, _, path)) = self.base.oldest_file(now.date_naive())? else {
            return Ok(MessageBatch::new());
        };

        if self.writer.is_some() && self.base.current_path.as_deref() == Some(path.as_path()) {
            if self.base.current_size == 0 {
                // The only candidate is the untouched write target
                return Ok(MessageBatch::new());
            }
            // Never consume the open write target; move it forward first
            self.open_internal(true, now).map_err(store_err_to_io)?;
        }

        let bytes = fs::read(&path)?;
        Ok(decode_entries(
            &bytes,
            self.base.write_category,
            &self.base.category,
        ))
    }

    async fn replace_oldest(
        &mut self,
        batch: MessageBatch,
        now: DateTime<Local>,
    ) -> io::Result<()> {
        let Some((_, _, path)) = self.base.oldest_file(now.date_naive())? else {
            return Ok(());
        };

        if self.writer.is_some() && self.base.current_path.as_deref() == Some(path.as_path()) {
            self.open_internal(true, now).map_err(store_err_to_io)?;
        }

        let mut buf = Vec::new();
        for entry in &batch {
            buf.extend_from_slice(&encode_entry(entry, self.base.write_category, true));
        }

        // Rewrite atomically; the .tmp name never matches the data pattern
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &path)
    }

    async fn delete_oldest(&mut self, now: DateTime<Local>) -> io::Result<()> {
        let Some((_, _, path)) = self.base.oldest_file(now.date_naive())? else {
            return Ok(());
        };
        if self.base.current_path.as_deref() == Some(path.as_path()) {
            self.drop_writer();
        }
        fs::remove_file(&path)
    }

    async fn empty(&mut self, now: DateTime<Local>) -> bool {
        if self.base.events_written > 0 {
            return false;
        }
        let today = now.date_naive();
        match self.base.scan_files() {
            Ok(files) => !files.iter().any(|&(date, suffix)| {
                date <= today
                    && fs::metadata(self.base.full_filename(date, suffix))
                        .map(|m| m.len())
                        .unwrap_or(0)
                        > 0
            }),
            Err(e) => {
                tracing::warn!(
                    category = %self.base.category,
                    error = %e,
                    "queue scan failed"
                );
                false
            }
        }
    }
}
