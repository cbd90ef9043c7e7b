//! Sluice - Protocol
//!
//! Foundational types that flow through the store pipeline:
//! - `LogEntry` - a single categorized log message
//! - `MessageBatch` - the ordered unit of submission and failure accounting
//! - `wire` - the framed batch codec spoken between peer servers
//!
//! # Design Principles
//!
//! - **Cheap fan-out**: message payloads are `bytes::Bytes`, so composite
//!   stores can hand the same batch to several children without copying
//!   the payload bytes.
//! - **Suffix residuals**: a store that fails part-way through a batch
//!   returns the unprocessed *suffix*; the committed prefix is never
//!   re-submitted. Everything downstream relies on that discipline.

mod entry;

pub mod wire;

pub use entry::{batch_bytes, LogEntry, MessageBatch};
pub use wire::{SendStatus, WireError};

// Re-export bytes for convenience
pub use bytes::Bytes;
