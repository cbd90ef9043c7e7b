//! Bucket store - key-based partitioning to N children.
//!
//! Each message is split at the first delimiter; the prefix is the key and
//! the key decides the bucket. Messages with no delimiter land in bucket 0,
//! the orphan sink. Hashing is FNV-1a so the partition assignment is stable
//! across processes and restarts.

use async_trait::async_trait;
use bytes::Bytes;
use sluice_protocol::{LogEntry, MessageBatch};

use crate::common::{Handled, StatusLine};
use crate::options::StoreOptions;
use crate::store::{create_store, Store, StoreContext};

const DEFAULT_DELIMITER: u8 = b':';

const RECOGNIZED: &[&str] = &[
    "num_buckets",
    "bucket_type",
    "delimiter",
    "remove_key",
    "bucket",
];

/// How a key maps to a bucket number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bucketizer {
    /// `hash(key) mod num_buckets`
    #[default]
    KeyHash,

    /// `parse_integer(key) mod num_buckets`, 0 if unparseable
    KeyModulo,

    /// Structured context prefix `context:ordinal`; the trailing ordinal
    /// modulo `num_buckets`, hash of the key when absent
    ContextLog,
}

impl Bucketizer {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "key_hash" => Some(Bucketizer::KeyHash),
            "key_modulo" => Some(Bucketizer::KeyModulo),
            "context_log" => Some(Bucketizer::ContextLog),
            _ => None,
        }
    }
}

/// FNV-1a. Stability across restarts matters: the same key must keep
/// landing in the same bucket.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn parse_ascii_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Store that hash-partitions batches across child stores
pub struct BucketStore {
    ctx: StoreContext,
    category: String,
    multi: bool,

    // configuration
    bucket_type: Bucketizer,
    delimiter: u8,
    remove_key: bool,
    num_buckets: usize,
    config_error: Option<String>,
    saved_options: StoreOptions,

    children: Vec<Box<dyn Store>>,
    opened: bool,
    status: StatusLine,
}

impl BucketStore {
    /// Create an unconfigured bucket store
    pub fn new(ctx: StoreContext, category: &str, multi_category: bool) -> Self {
        Self {
            ctx,
            category: category.to_string(),
            multi: multi_category,
            bucket_type: Bucketizer::default(),
            delimiter: DEFAULT_DELIMITER,
            remove_key: false,
            num_buckets: 0,
            config_error: None,
            saved_options: StoreOptions::new(),
            children: Vec::new(),
            opened: false,
            status: StatusLine::new(),
        }
    }

    /// Bucket index for a message
    pub fn bucketize(&self, message: &[u8]) -> usize {
        if self.num_buckets == 0 {
            return 0;
        }
        let Some(pos) = message.iter().position(|&b| b == self.delimiter) else {
            // No key: orphan bucket
            return 0;
        };
        let key = &message[..pos];
        match self.bucket_type {
            Bucketizer::KeyHash => (fnv1a(key) % self.num_buckets as u64) as usize,
            Bucketizer::KeyModulo => parse_ascii_u64(key)
                .map(|value| (value % self.num_buckets as u64) as usize)
                .unwrap_or(0),
            Bucketizer::ContextLog => {
                let ordinal = key
                    .rsplit(|&b| b == b':')
                    .next()
                    .and_then(parse_ascii_u64);
                match ordinal {
                    Some(value) => (value % self.num_buckets as u64) as usize,
                    None => (fnv1a(key) % self.num_buckets as u64) as usize,
                }
            }
        }
    }

    /// Message with the key and delimiter stripped
    fn without_key(&self, message: &Bytes) -> Bytes {
        match message.iter().position(|&b| b == self.delimiter) {
            Some(pos) => message.slice(pos + 1..),
            None => message.clone(),
        }
    }
}

#[async_trait]
impl Store for BucketStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        "bucket"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        match options.get_u64("num_buckets") {
            Some(buckets) if buckets > 0 => self.num_buckets = buckets as usize,
            Some(_) | None => {
                self.config_error = Some("num_buckets must be a positive integer".into());
            }
        }
        if let Some(kind) = options.get_str("bucket_type") {
            match Bucketizer::parse(&kind) {
                Some(parsed) => self.bucket_type = parsed,
                None => self.config_error = Some(format!("unknown bucket_type {kind:?}")),
            }
        }
        if let Some(delim) = options.get_str("delimiter") {
            match delim.as_bytes() {
                [byte] => self.delimiter = *byte,
                _ => {
                    self.config_error =
                        Some(format!("delimiter must be a single byte, got {delim:?}"))
                }
            }
        }
        if let Some(remove) = options.get_bool("remove_key") {
            self.remove_key = remove;
        }

        self.children.clear();
        if self.config_error.is_none() {
            let model = options.section("bucket").and_then(|section| {
                let store_type = section.get_str("type")?;
                let mut model = create_store(&self.ctx, &store_type, &self.category, self.multi)?;
                model.configure(section);
                Some(model)
            });
            match model {
                Some(model) => {
                    for index in 0..self.num_buckets {
                        let name = format!("{}_{:03}", self.category, index);
                        self.children.push(model.copy_for_category(&name));
                    }
                }
                None => {
                    self.config_error = Some("bucket store requires a bucket model section".into());
                }
            }
        }

        if let Some(message) = &self.config_error {
            self.status.set(format!("misconfigured: {message}"));
            tracing::error!(
                category = %self.category,
                error = %message,
                "bucket store misconfigured"
            );
        }

        self.saved_options = options.clone();
        options.warn_unknown(RECOGNIZED, self.store_type(), &self.category);
    }

    async fn open(&mut self) -> bool {
        if self.config_error.is_some() {
            return false;
        }
        // Children fail independently; the store is open if all came up
        let mut all_ok = true;
        for child in &mut self.children {
            if !child.open().await {
                tracing::warn!(
                    category = %self.category,
                    bucket = child.category(),
                    "bucket child failed to open"
                );
                all_ok = false;
            }
        }
        self.opened = all_ok;
        all_ok
    }

    fn is_open(&self) -> bool {
        self.opened && !self.children.is_empty()
    }

    async fn close(&mut self) {
        for child in &mut self.children {
            child.close().await;
        }
        self.opened = false;
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        if batch.is_empty() {
            return Handled::Complete;
        }
        if self.children.is_empty() {
            return Handled::Residual(batch);
        }

        let mut partitions: Vec<MessageBatch> = vec![MessageBatch::new(); self.num_buckets];
        for entry in batch {
            let bucket = self.bucketize(&entry.message);
            let entry = if self.remove_key {
                LogEntry {
                    category: entry.category,
                    message: self.without_key(&entry.message),
                }
            } else {
                entry
            };
            partitions[bucket].push(entry);
        }

        let mut residual = MessageBatch::new();
        for (bucket, partition) in partitions.into_iter().enumerate() {
            if partition.is_empty() {
                continue;
            }
            if let Handled::Residual(rest) = self.children[bucket].handle_messages(partition).await
            {
                tracing::warn!(
                    category = %self.category,
                    bucket,
                    unsent = rest.len(),
                    "bucket child refused messages"
                );
                residual.extend(rest);
            }
        }

        if residual.is_empty() {
            Handled::Complete
        } else {
            Handled::Residual(residual)
        }
    }

    async fn periodic_check(&mut self) {
        for child in &mut self.children {
            child.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for child in &mut self.children {
            child.flush().await;
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        let mut copy = BucketStore::new(self.ctx.clone(), category, self.multi);
        copy.configure(&self.saved_options);
        Box::new(copy)
    }

    fn status(&self) -> String {
        let own = self.status.get();
        if !own.is_empty() {
            return own;
        }
        self.children
            .iter()
            .map(|c| c.status())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "bucket_test.rs"]
mod bucket_test;
