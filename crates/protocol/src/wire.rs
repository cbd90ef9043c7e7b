//! Wire codec for peer-to-peer batch transfer.
//!
//! A batch frame is a flat big-endian layout:
//!
//! ```text
//! [4 bytes: entry count]
//! per entry:
//!   [2 bytes: category length][category bytes]
//!   [4 bytes: message length][message bytes]
//! ```
//!
//! The receiving server replies with a single status byte (`SendStatus`).
//! The 4-byte frame length prefix on the socket is applied by the
//! connection layer, not here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::entry::{LogEntry, MessageBatch};

/// Upper bound on a decoded frame; anything larger is rejected as corrupt.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Upper bound on a category name on the wire.
pub const MAX_CATEGORY_BYTES: usize = u16::MAX as usize;

/// Result code returned by a peer for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SendStatus {
    /// Batch fully accepted
    Ok = 0,

    /// Peer is overloaded or draining; re-submit the batch later
    TryAgain = 1,
}

impl SendStatus {
    /// Wire byte for this status
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SendStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(SendStatus::Ok),
            1 => Ok(SendStatus::TryAgain),
            other => Err(WireError::BadStatus(other)),
        }
    }
}

/// Errors from encoding or decoding batch frames
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame ended before the advertised contents
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// Frame advertises more data than the codec will accept
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// Category longer than the 2-byte length field allows
    #[error("category too long: {0} bytes")]
    CategoryTooLong(usize),

    /// Unknown status byte in a peer response
    #[error("unknown status byte: {0}")]
    BadStatus(u8),
}

/// Encode a batch into a single frame.
pub fn encode_batch(batch: &[LogEntry]) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(frame_len(batch));
    buf.put_u32(batch.len() as u32);
    for entry in batch {
        let cat = entry.category.as_bytes();
        if cat.len() > MAX_CATEGORY_BYTES {
            return Err(WireError::CategoryTooLong(cat.len()));
        }
        buf.put_u16(cat.len() as u16);
        buf.put_slice(cat);
        buf.put_u32(entry.message.len() as u32);
        buf.put_slice(&entry.message);
    }
    Ok(buf.freeze())
}

/// Exact encoded size of a batch frame.
pub fn frame_len(batch: &[LogEntry]) -> usize {
    4 + batch
        .iter()
        .map(|e| 6 + e.category.len() + e.message.len())
        .sum::<usize>()
}

/// Decode a frame back into a batch.
pub fn decode_batch(frame: &[u8]) -> Result<MessageBatch, WireError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(WireError::TooLarge(frame.len()));
    }
    let mut buf = frame;
    let count = take_u32(&mut buf)? as usize;
    let mut batch = MessageBatch::with_capacity(count.min(64 * 1024));
    for _ in 0..count {
        let cat_len = take_u16(&mut buf)? as usize;
        let category = take_bytes(&mut buf, cat_len)?;
        let msg_len = take_u32(&mut buf)? as usize;
        let message = take_bytes(&mut buf, msg_len)?;
        batch.push(LogEntry {
            category: String::from_utf8_lossy(&category).into_owned(),
            message: Bytes::from(message),
        });
    }
    Ok(batch)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, WireError> {
    ensure(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        Err(WireError::Truncated {
            needed: needed - buf.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> MessageBatch {
        vec![
            LogEntry::new("web", &b"GET /index"[..]),
            LogEntry::new("db", &b"slow query: 120ms"[..]),
            LogEntry::new("web", &b""[..]),
        ]
    }

    #[test]
    fn roundtrip() {
        let batch = sample_batch();
        let frame = encode_batch(&batch).unwrap();
        assert_eq!(frame.len(), frame_len(&batch));

        let decoded = decode_batch(&frame).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn empty_batch() {
        let frame = encode_batch(&[]).unwrap();
        assert_eq!(frame.as_ref(), &[0, 0, 0, 0]);
        assert!(decode_batch(&frame).unwrap().is_empty());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let frame = encode_batch(&sample_batch()).unwrap();
        let cut = &frame[..frame.len() - 3];
        assert!(matches!(
            decode_batch(cut),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn truncated_header_is_an_error() {
        assert!(matches!(
            decode_batch(&[0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn status_byte_conversions() {
        assert_eq!(SendStatus::Ok.as_byte(), 0);
        assert_eq!(SendStatus::TryAgain.as_byte(), 1);
        assert_eq!(SendStatus::try_from(0u8).unwrap(), SendStatus::Ok);
        assert_eq!(SendStatus::try_from(1u8).unwrap(), SendStatus::TryAgain);
        assert!(matches!(
            SendStatus::try_from(7u8),
            Err(WireError::BadStatus(7))
        ));
    }
}
