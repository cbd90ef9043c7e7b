//! Length-prefixed record transport for framed files.
//!
//! Records are `varint length + payload` with no separators. The writer
//! buffers up to `msg_buffer_size` bytes and flushes on a time cadence
//! checked at every write; `flush` drains synchronously and syncs to disk.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Encode a u64 as LEB128 into `buf`; returns the encoded length.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) -> usize {
    let start = buf.len();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
    buf.len() - start
}

/// Encoded length of a varint without encoding it
pub fn varint_len(value: u64) -> usize {
    (64 - (value | 1).leading_zeros() as usize).div_ceil(7)
}

fn read_varint(reader: &mut impl Read) -> io::Result<Option<u64>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && first => return Ok(None),
            Err(e) => return Err(e),
        }
        first = false;
        if shift >= 63 && byte[0] > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint overflows u64",
            ));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Buffered writer of varint-framed records with a background-style flush
/// cadence (checked on every write rather than from a separate thread).
pub struct FramedTransport {
    writer: BufWriter<fs::File>,
    flush_frequency: Duration,
    last_flush: Instant,
}

impl FramedTransport {
    pub fn new(file: fs::File, msg_buffer_size: usize, flush_frequency: Duration) -> Self {
        Self {
            writer: BufWriter::with_capacity(msg_buffer_size.max(4096), file),
            flush_frequency,
            last_flush: Instant::now(),
        }
    }

    /// Append one record; returns the on-disk size (varint + payload)
    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<usize> {
        let mut prefix = Vec::with_capacity(10);
        write_varint(&mut prefix, payload.len() as u64);
        self.writer.write_all(&prefix)?;
        self.writer.write_all(payload)?;
        self.maybe_flush()?;
        Ok(prefix.len() + payload.len())
    }

    /// Flush if the cadence interval has elapsed
    pub fn maybe_flush(&mut self) -> io::Result<()> {
        if self.last_flush.elapsed() >= self.flush_frequency {
            self.writer.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Drain the buffer and sync to disk
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flush without syncing (used on close and rotation)
    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Sequential reader of varint-framed record files
pub struct FramedReader {
    reader: BufReader<fs::File>,
}

impl FramedReader {
    /// Open a framed record file
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::with_capacity(32 * 1024, fs::File::open(path)?),
        })
    }

    /// Read the next record; `None` at end of file
    pub fn read_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(len) = read_varint(&mut self.reader)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        Ok(Some(payload))
    }

    /// Read every remaining record
    pub fn read_all(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }
}
