//! Buffer store - a primary sink backed by a readable secondary.
//!
//! The store streams batches straight to its primary (typically a network
//! store). When the primary fails it switches to buffering batches in the
//! secondary (typically a buffer-mode file store), retries the primary on a
//! jittered interval, and once the primary is back drains the buffered
//! files oldest-first before resuming streaming.
//!
//! # State Machine
//!
//! ```text
//!                 primary write fails
//!   STREAMING -------------------------> DISCONNECTED
//!       ^                                   |
//!       | secondary                         | retry elapsed,
//!       | drained                           | primary.open() ok
//!       |                                   v
//!       +---------------------------- SENDING_BUFFER
//!                 (primary fails mid-drain: back to DISCONNECTED)
//! ```
//!
//! Writes that arrive during SENDING_BUFFER go to the secondary, behind the
//! buffered backlog, so delivery stays in temporal order at the cost of
//! briefly bypassing the already-open primary. Delivery is at-least-once:
//! a drain interrupted between the send and the delete replays the file.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use sluice_protocol::MessageBatch;

use crate::common::{Handled, StatusLine, StoreCounters};
use crate::options::StoreOptions;
use crate::store::{create_readable_store, create_store, ReadableStore, Store, StoreContext};

const DEFAULT_MAX_QUEUE_LENGTH: usize = 2_000_000;
const DEFAULT_BUFFER_SEND_RATE: usize = 1;
const DEFAULT_AVG_RETRY_INTERVAL_SECS: u64 = 300;
const DEFAULT_RETRY_INTERVAL_RANGE_SECS: u64 = 60;

const RECOGNIZED: &[&str] = &[
    "max_queue_length",
    "buffer_send_rate",
    "retry_interval",
    "retry_interval_range",
    "primary",
    "secondary",
];

/// Delivery mode of a buffer store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Primary is up; writes go straight to it
    Streaming,

    /// Primary is down; writes go to the secondary
    Disconnected,

    /// Primary is back; draining the secondary, new writes still buffer
    SendingBuffer,
}

impl BufferState {
    /// Human-readable state name (status lines, logs)
    pub fn as_str(self) -> &'static str {
        match self {
            BufferState::Streaming => "streaming",
            BufferState::Disconnected => "disconnected",
            BufferState::SendingBuffer => "sending_buffer",
        }
    }
}

/// Primary + readable secondary with outage buffering
pub struct BufferStore {
    ctx: StoreContext,
    category: String,
    multi: bool,

    primary: Option<Box<dyn Store>>,
    secondary: Option<Box<dyn ReadableStore>>,
    saved_options: StoreOptions,
    config_error: Option<String>,

    // configuration
    max_queue_length: usize,
    buffer_send_rate: usize,
    avg_retry_interval: Duration,
    retry_interval_range: Duration,

    // state
    state: BufferState,
    retry_interval: Duration,
    last_open_attempt: Instant,
    pending: VecDeque<sluice_protocol::LogEntry>,
    dropped_total: u64,

    status: StatusLine,
    counters: StoreCounters,
}

impl BufferStore {
    /// Create an unconfigured buffer store
    pub fn new(ctx: StoreContext, category: &str, multi_category: bool) -> Self {
        Self {
            ctx,
            category: category.to_string(),
            multi: multi_category,
            primary: None,
            secondary: None,
            saved_options: StoreOptions::new(),
            config_error: None,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            buffer_send_rate: DEFAULT_BUFFER_SEND_RATE,
            avg_retry_interval: Duration::from_secs(DEFAULT_AVG_RETRY_INTERVAL_SECS),
            retry_interval_range: Duration::from_secs(DEFAULT_RETRY_INTERVAL_RANGE_SECS),
            state: BufferState::Disconnected,
            retry_interval: Duration::from_secs(DEFAULT_AVG_RETRY_INTERVAL_SECS),
            last_open_attempt: Instant::now(),
            pending: VecDeque::new(),
            dropped_total: 0,
            status: StatusLine::new(),
            counters: StoreCounters::new(),
        }
    }

    /// Current state (visible for the owner's introspection)
    pub fn state(&self) -> BufferState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn set_children(
        &mut self,
        primary: Box<dyn Store>,
        secondary: Box<dyn ReadableStore>,
    ) {
        self.primary = Some(primary);
        self.secondary = Some(secondary);
    }

    /// Messages dropped under the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped_total
    }

    /// Random interval in `[avg - range/2, avg + range/2]`
    fn new_retry_interval(&self) -> Duration {
        let avg = self.avg_retry_interval.as_secs_f64();
        let range = self.retry_interval_range.as_secs_f64();
        let low = (avg - range / 2.0).max(0.0);
        let high = avg + range / 2.0;
        if high <= low {
            return Duration::from_secs_f64(low);
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }

    /// Enter a new state, running its entry actions.
    async fn change_state(&mut self, new_state: BufferState) {
        let old_state = self.state;
        match new_state {
            BufferState::Streaming => {
                if let Some(secondary) = self.secondary.as_mut() {
                    secondary.close().await;
                }
                self.status.clear();
            }
            BufferState::Disconnected => {
                if let Some(primary) = self.primary.as_mut() {
                    primary.close().await;
                }
                if let Some(secondary) = self.secondary.as_mut() {
                    secondary.open().await;
                }
                self.status.set("primary down, buffering to secondary");
            }
            BufferState::SendingBuffer => {
                if let Some(secondary) = self.secondary.as_mut() {
                    if !secondary.is_open() {
                        secondary.open().await;
                    }
                }
                self.status.set("draining buffered messages to primary");
            }
        }

        self.state = new_state;
        self.last_open_attempt = Instant::now();
        self.retry_interval = self.new_retry_interval();

        tracing::info!(
            category = %self.category,
            from = old_state.as_str(),
            to = new_state.as_str(),
            retry_secs = self.retry_interval.as_secs_f64(),
            "buffer state change"
        );
    }

    /// Write a batch (preceded by any pending backlog) to the secondary,
    /// applying the overflow policy when the secondary refuses.
    async fn store_to_secondary(&mut self, mut batch: MessageBatch) -> Handled {
        if !self.pending.is_empty() {
            let mut combined: MessageBatch = self.pending.drain(..).collect();
            combined.append(&mut batch);
            batch = combined;
        }
        if batch.is_empty() {
            return Handled::Complete;
        }

        let refused = match self.secondary.as_mut() {
            Some(secondary) => {
                if !secondary.is_open() {
                    secondary.open().await;
                }
                secondary.handle_messages(batch).await.into_residual()
            }
            None => batch,
        };

        if refused.is_empty() {
            return Handled::Complete;
        }

        tracing::warn!(
            category = %self.category,
            refused = refused.len(),
            "secondary refused messages; holding in memory"
        );
        self.pending.extend(refused);

        let over = self.pending.len().saturating_sub(self.max_queue_length);
        if over > 0 {
            self.pending.drain(..over);
            self.dropped_total += over as u64;
            self.counters.record_dropped(over as u64);
            self.status.set(format!(
                "secondary failing; dropped {} messages",
                self.dropped_total
            ));
            tracing::error!(
                category = %self.category,
                dropped = over,
                total_dropped = self.dropped_total,
                "memory queue overflow, oldest messages dropped"
            );
        }
        Handled::Complete
    }

    /// Drain up to `buffer_send_rate` buffer files into the primary.
    async fn drain(&mut self) {
        let now = Local::now();
        for _ in 0..self.buffer_send_rate.max(1) {
            let is_empty = match self.secondary.as_mut() {
                Some(secondary) => secondary.empty(now).await,
                None => true,
            };
            if is_empty {
                self.change_state(BufferState::Streaming).await;
                return;
            }

            let Some(secondary) = self.secondary.as_mut() else {
                return;
            };
            let read = match secondary.read_oldest(now).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.status.set(format!("buffer read failed: {e}"));
                    tracing::error!(
                        category = %self.category,
                        error = %e,
                        "failed to read buffer file; will retry"
                    );
                    return;
                }
            };

            if read.is_empty() {
                // Degenerate empty file; discard and move on
                if let Err(e) = secondary.delete_oldest(now).await {
                    tracing::warn!(
                        category = %self.category,
                        error = %e,
                        "failed to delete empty buffer file"
                    );
                    return;
                }
                continue;
            }

            let count = read.len() as u64;
            let Some(primary) = self.primary.as_mut() else {
                return;
            };
            match primary.handle_messages(read).await {
                Handled::Complete => {
                    self.counters.record_committed(count);
                    if let Err(e) = self.secondary_delete_oldest(now).await {
                        tracing::error!(
                            category = %self.category,
                            error = %e,
                            "failed to delete drained buffer file; duplicates possible"
                        );
                        return;
                    }
                    tracing::debug!(
                        category = %self.category,
                        sent = count,
                        "drained one buffer file"
                    );
                }
                Handled::Residual(rest) => {
                    tracing::warn!(
                        category = %self.category,
                        unsent = rest.len(),
                        "primary failed mid-drain"
                    );
                    if let Some(secondary) = self.secondary.as_mut() {
                        if let Err(e) = secondary.replace_oldest(rest, now).await {
                            tracing::error!(
                                category = %self.category,
                                error = %e,
                                "failed to rewrite buffer file; duplicates possible"
                            );
                        }
                    }
                    self.change_state(BufferState::Disconnected).await;
                    return;
                }
            }
        }
    }

    async fn secondary_delete_oldest(&mut self, now: chrono::DateTime<Local>) -> std::io::Result<()> {
        match self.secondary.as_mut() {
            Some(secondary) => secondary.delete_oldest(now).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for BufferStore {
    fn category(&self) -> &str {
        &self.category
    }

    fn store_type(&self) -> &'static str {
        "buffer"
    }

    fn multi_category(&self) -> bool {
        self.multi
    }

    fn configure(&mut self, options: &StoreOptions) {
        if let Some(len) = options.get_u64("max_queue_length") {
            self.max_queue_length = len as usize;
        }
        if let Some(rate) = options.get_u64("buffer_send_rate") {
            self.buffer_send_rate = rate as usize;
        }
        if let Some(secs) = options.get_u64("retry_interval") {
            self.avg_retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = options.get_u64("retry_interval_range") {
            self.retry_interval_range = Duration::from_secs(secs);
        }

        self.primary = options
            .section("primary")
            .and_then(|section| {
                let store_type = section.get_str("type")?;
                let mut child =
                    create_store(&self.ctx, &store_type, &self.category, self.multi)?;
                child.configure(section);
                Some(child)
            });
        if self.primary.is_none() {
            self.config_error = Some("buffer store requires a primary section".into());
        }

        self.secondary = options
            .section("secondary")
            .and_then(|section| {
                let store_type = section.get_str("type")?;
                let mut child = create_readable_store(&store_type, &self.category, self.multi)?;
                child.configure(section);
                Some(child)
            });
        if self.secondary.is_none() {
            self.config_error =
                Some("buffer store requires a readable secondary section".into());
        }

        if let Some(message) = &self.config_error {
            self.status.set(format!("misconfigured: {message}"));
            tracing::error!(
                category = %self.category,
                error = %message,
                "buffer store misconfigured"
            );
        }

        self.retry_interval = self.new_retry_interval();
        self.saved_options = options.clone();
        options.warn_unknown(RECOGNIZED, self.store_type(), &self.category);
    }

    async fn open(&mut self) -> bool {
        if self.config_error.is_some() {
            return false;
        }
        let primary_up = match self.primary.as_mut() {
            Some(primary) => primary.open().await,
            None => false,
        };
        self.last_open_attempt = Instant::now();

        if primary_up {
            let now = Local::now();
            let leftover = match self.secondary.as_mut() {
                Some(secondary) => !secondary.empty(now).await,
                None => false,
            };
            if leftover {
                // Crash recovery: finish the old backlog before streaming
                self.change_state(BufferState::SendingBuffer).await;
            } else {
                self.change_state(BufferState::Streaming).await;
            }
        } else {
            self.change_state(BufferState::Disconnected).await;
        }
        true
    }

    fn is_open(&self) -> bool {
        if self.config_error.is_some() {
            return false;
        }
        match self.state {
            BufferState::Disconnected => true,
            _ => self.primary.as_ref().is_some_and(|p| p.is_open()),
        }
    }

    async fn close(&mut self) {
        if !self.pending.is_empty() {
            let backlog: MessageBatch = self.pending.drain(..).collect();
            self.store_to_secondary(backlog).await;
        }
        if let Some(primary) = self.primary.as_mut() {
            primary.flush().await;
            primary.close().await;
        }
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.close().await;
        }
    }

    async fn handle_messages(&mut self, batch: MessageBatch) -> Handled {
        if batch.is_empty() {
            return Handled::Complete;
        }
        self.counters.record_received(batch.len() as u64);

        match self.state {
            BufferState::Streaming => {
                let count = batch.len() as u64;
                let Some(primary) = self.primary.as_mut() else {
                    return Handled::Residual(batch);
                };
                match primary.handle_messages(batch).await {
                    Handled::Complete => {
                        self.counters.record_committed(count);
                        Handled::Complete
                    }
                    Handled::Residual(rest) => {
                        tracing::warn!(
                            category = %self.category,
                            unsent = rest.len(),
                            "primary write failed, disconnecting"
                        );
                        self.change_state(BufferState::Disconnected).await;
                        self.store_to_secondary(rest).await
                    }
                }
            }
            BufferState::Disconnected | BufferState::SendingBuffer => {
                self.store_to_secondary(batch).await
            }
        }
    }

    async fn periodic_check(&mut self) {
        match self.state {
            BufferState::Streaming => {
                // Entries parked while the secondary was failing go out now
                if !self.pending.is_empty() {
                    let backlog: MessageBatch = self.pending.drain(..).collect();
                    let count = backlog.len() as u64;
                    let delivered = match self.primary.as_mut() {
                        Some(primary) => primary.handle_messages(backlog).await,
                        None => Handled::Residual(MessageBatch::new()),
                    };
                    match delivered {
                        Handled::Complete => self.counters.record_committed(count),
                        Handled::Residual(rest) => {
                            self.change_state(BufferState::Disconnected).await;
                            self.store_to_secondary(rest).await;
                        }
                    }
                }
            }
            BufferState::Disconnected => {
                // Re-offer anything the secondary refused earlier
                if !self.pending.is_empty() {
                    self.store_to_secondary(MessageBatch::new()).await;
                }
                if self.last_open_attempt.elapsed() >= self.retry_interval {
                    self.last_open_attempt = Instant::now();
                    let opened = match self.primary.as_mut() {
                        Some(primary) => primary.open().await,
                        None => false,
                    };
                    if opened {
                        self.change_state(BufferState::SendingBuffer).await;
                    } else {
                        self.retry_interval = self.new_retry_interval();
                        tracing::debug!(
                            category = %self.category,
                            retry_secs = self.retry_interval.as_secs_f64(),
                            "primary still down"
                        );
                    }
                }
            }
            BufferState::SendingBuffer => {
                if !self.pending.is_empty() {
                    self.store_to_secondary(MessageBatch::new()).await;
                }
                self.drain().await;
            }
        }

        if let Some(primary) = self.primary.as_mut() {
            primary.periodic_check().await;
        }
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        if !self.pending.is_empty() && self.state != BufferState::Streaming {
            self.store_to_secondary(MessageBatch::new()).await;
        }
        if self.state == BufferState::Streaming {
            if let Some(primary) = self.primary.as_mut() {
                primary.flush().await;
            }
        }
        if let Some(secondary) = self.secondary.as_mut() {
            if secondary.is_open() {
                secondary.flush().await;
            }
        }
    }

    fn copy_for_category(&self, category: &str) -> Box<dyn Store> {
        let mut copy = BufferStore::new(self.ctx.clone(), category, self.multi);
        copy.configure(&self.saved_options);
        Box::new(copy)
    }

    fn status(&self) -> String {
        let own = self.status.get();
        if own.is_empty() {
            // Healthy here; surface the primary's view
            self.primary
                .as_ref()
                .map(|p| p.status())
                .unwrap_or_default()
        } else {
            own
        }
    }
}
