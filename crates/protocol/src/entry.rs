//! Log entries and message batches.

use bytes::Bytes;

/// A single log message tagged with its routing category.
///
/// Messages are opaque bytes; the pipeline never inspects them except where
/// a store is explicitly configured to (key extraction in a bucket store).
/// The category is the routing key and is immutable for the life of the
/// entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Logical topic this message belongs to
    pub category: String,

    /// Opaque payload, typically newline-free text
    pub message: Bytes,
}

impl LogEntry {
    /// Create a new entry
    pub fn new(category: impl Into<String>, message: impl Into<Bytes>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.message.len()
    }

    /// True if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }
}

/// An ordered sequence of entries.
///
/// Batches are the unit of submission and of failure recovery: a store that
/// cannot commit a whole batch returns the residual suffix of unprocessed
/// entries, and the caller re-submits only that suffix.
pub type MessageBatch = Vec<LogEntry>;

/// Total payload bytes across a batch (for logging and size accounting).
pub fn batch_bytes(batch: &[LogEntry]) -> usize {
    batch.iter().map(|e| e.message.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_construction() {
        let entry = LogEntry::new("web", &b"hello"[..]);
        assert_eq!(entry.category, "web");
        assert_eq!(entry.message.as_ref(), b"hello");
        assert_eq!(entry.len(), 5);
        assert!(!entry.is_empty());
    }

    #[test]
    fn batch_bytes_sums_payloads() {
        let batch = vec![
            LogEntry::new("a", &b"12345"[..]),
            LogEntry::new("b", &b"678"[..]),
        ];
        assert_eq!(batch_bytes(&batch), 8);
        assert_eq!(batch_bytes(&[]), 0);
    }
}
