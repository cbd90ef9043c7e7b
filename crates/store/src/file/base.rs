//! Filename, rotation, and rolling state shared by the file-backed stores.
//!
//! A store writes into a rotation-indexed family of files in one directory:
//!
//! ```text
//! <file_path>/<base_filename>_YYYY-mm-dd_NNNNN
//! ```
//!
//! Suffixes are dense within a base date and ordered the same
//! lexicographically and numerically. The newest suffix for the current
//! date is the write target; rotation closes it and opens the next suffix.
//! This module is a helper consumed by `FileStore` and `FramedFileStore`,
//! which own the actual file handles.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Timelike};

use crate::options::StoreOptions;

/// Default rotation size: 1 GiB
pub const DEFAULT_MAX_SIZE: u64 = 1 << 30;

/// Default hour for daily rolls
pub const DEFAULT_ROLL_HOUR: u32 = 1;

/// Default minute for daily rolls
pub const DEFAULT_ROLL_MINUTE: u32 = 15;

/// Time-based rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollPeriod {
    /// Rotate only by size
    #[default]
    Never,

    /// Rotate when the wall-clock hour changes
    Hourly,

    /// Rotate once per day, at `roll_hour:roll_minute`
    Daily,
}

impl RollPeriod {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(RollPeriod::Never),
            "hourly" => Some(RollPeriod::Hourly),
            "daily" => Some(RollPeriod::Daily),
            _ => None,
        }
    }
}

/// Configuration keys this engine recognizes; file stores add their own.
pub(crate) const BASE_RECOGNIZED: &[&str] = &[
    "file_path",
    "base_filename",
    "max_size",
    "roll_period",
    "roll_hour",
    "roll_minute",
    "chunk_size",
    "fs_type",
    "write_meta",
    "write_category",
    "create_symlink",
];

/// Shared naming/rotation state. Embedded by value in each file store.
#[derive(Debug, Clone)]
pub(crate) struct FileStoreBase {
    pub category: String,

    // configuration
    pub file_path: PathBuf,
    pub base_file_name: String,
    pub max_size: u64,
    pub roll_period: RollPeriod,
    pub roll_hour: u32,
    pub roll_minute: u32,
    pub chunk_size: u64,
    pub write_meta: bool,
    pub write_category: bool,
    pub create_symlink: bool,
    pub config_error: Option<String>,

    // Whether base_filename was configured explicitly; implicit names
    // follow the category on copy.
    explicit_base_name: bool,

    // state of the currently open file
    pub current_path: Option<PathBuf>,
    pub current_date: NaiveDate,
    pub current_suffix: u32,
    pub current_size: u64,
    pub events_written: u64,
    pub last_roll: DateTime<Local>,
}

impl FileStoreBase {
    pub fn new(category: &str) -> Self {
        let now = Local::now();
        Self {
            category: category.to_string(),
            file_path: PathBuf::from("/tmp"),
            base_file_name: category.to_string(),
            max_size: DEFAULT_MAX_SIZE,
            roll_period: RollPeriod::Never,
            roll_hour: DEFAULT_ROLL_HOUR,
            roll_minute: DEFAULT_ROLL_MINUTE,
            chunk_size: 0,
            write_meta: false,
            write_category: false,
            create_symlink: false,
            config_error: None,
            explicit_base_name: false,
            current_path: None,
            current_date: now.date_naive(),
            current_suffix: 0,
            current_size: 0,
            events_written: 0,
            last_roll: now,
        }
    }

    pub fn configure(&mut self, options: &StoreOptions) {
        if let Some(path) = options.get_str("file_path") {
            self.file_path = PathBuf::from(path);
        }
        if let Some(name) = options.get_str("base_filename") {
            self.base_file_name = name;
            self.explicit_base_name = true;
        }
        if let Some(size) = options.get_u64("max_size") {
            if size == 0 {
                self.fail_config("max_size must be positive");
            } else {
                self.max_size = size;
            }
        }
        if let Some(period) = options.get_str("roll_period") {
            match RollPeriod::parse(&period) {
                Some(parsed) => self.roll_period = parsed,
                None => self.fail_config(&format!("unknown roll_period {period:?}")),
            }
        }
        if let Some(hour) = options.get_u64("roll_hour") {
            if hour < 24 {
                self.roll_hour = hour as u32;
            } else {
                self.fail_config(&format!("roll_hour {hour} out of range"));
            }
        }
        if let Some(minute) = options.get_u64("roll_minute") {
            if minute < 60 {
                self.roll_minute = minute as u32;
            } else {
                self.fail_config(&format!("roll_minute {minute} out of range"));
            }
        }
        if let Some(chunk) = options.get_u64("chunk_size") {
            self.chunk_size = chunk;
        }
        if let Some(fs_type) = options.get_str("fs_type") {
            if fs_type != "std" {
                self.fail_config(&format!("unsupported fs_type {fs_type:?}"));
            }
        }
        if let Some(meta) = options.get_bool("write_meta") {
            self.write_meta = meta;
        }
        if let Some(cat) = options.get_bool("write_category") {
            self.write_category = cat;
        }
        if let Some(symlink) = options.get_bool("create_symlink") {
            self.create_symlink = symlink;
        }
    }

    fn fail_config(&mut self, message: &str) {
        tracing::error!(
            category = %self.category,
            error = message,
            "file store misconfigured"
        );
        self.config_error = Some(message.to_string());
    }

    /// Configuration clone for a sibling bound to another category. Implicit
    /// base names follow the new category; state starts fresh.
    pub fn copy_for(&self, category: &str) -> Self {
        let mut copy = Self::new(category);
        copy.file_path = self.file_path.clone();
        copy.base_file_name = if self.explicit_base_name {
            self.base_file_name.clone()
        } else {
            category.to_string()
        };
        copy.explicit_base_name = self.explicit_base_name;
        copy.max_size = self.max_size;
        copy.roll_period = self.roll_period;
        copy.roll_hour = self.roll_hour;
        copy.roll_minute = self.roll_minute;
        copy.chunk_size = self.chunk_size;
        copy.write_meta = self.write_meta;
        copy.write_category = self.write_category;
        copy.create_symlink = self.create_symlink;
        copy.config_error = self.config_error.clone();
        copy
    }

    // ------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------

    /// `<base_filename>_YYYY-mm-dd`
    pub fn make_base_filename(&self, date: NaiveDate) -> String {
        format!("{}_{}", self.base_file_name, date.format("%Y-%m-%d"))
    }

    /// Full path for a dated, suffixed data file
    pub fn full_filename(&self, date: NaiveDate, suffix: u32) -> PathBuf {
        self.file_path
            .join(format!("{}_{:05}", self.make_base_filename(date), suffix))
    }

    /// Path of the `<base_filename>_current` symlink
    pub fn symlink_path(&self) -> PathBuf {
        self.file_path.join(format!("{}_current", self.base_file_name))
    }

    /// Path of the stats sidecar
    pub fn stats_path(&self) -> PathBuf {
        self.file_path.join(format!("{}_stats", self.base_file_name))
    }

    /// Parse `(date, suffix)` out of a directory entry name; entries that do
    /// not match the data-file pattern are ignored.
    pub fn parse_data_file(&self, name: &str) -> Option<(NaiveDate, u32)> {
        let rest = name.strip_prefix(&self.base_file_name)?.strip_prefix('_')?;
        // YYYY-mm-dd is exactly 10 bytes
        if rest.len() < 12 {
            return None;
        }
        let (date_part, suffix_part) = rest.split_at(10);
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        let suffix_digits = suffix_part.strip_prefix('_')?;
        if suffix_digits.is_empty() || !suffix_digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let suffix = suffix_digits.parse().ok()?;
        Some((date, suffix))
    }

    /// All data files in the directory, sorted oldest first
    pub fn scan_files(&self) -> io::Result<Vec<(NaiveDate, u32)>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.file_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(parsed) = entry.file_name().to_str().and_then(|n| self.parse_data_file(n))
            {
                files.push(parsed);
            }
        }
        files.sort_unstable();
        Ok(files)
    }

    /// Highest suffix present for a base date
    pub fn find_newest_suffix(&self, date: NaiveDate) -> io::Result<Option<u32>> {
        Ok(self
            .scan_files()?
            .into_iter()
            .filter(|(d, _)| *d == date)
            .map(|(_, s)| s)
            .max())
    }

    /// Lowest suffix present for a base date
    pub fn find_oldest_suffix(&self, date: NaiveDate) -> io::Result<Option<u32>> {
        Ok(self
            .scan_files()?
            .into_iter()
            .filter(|(d, _)| *d == date)
            .map(|(_, s)| s)
            .min())
    }

    /// Oldest data file not dated after `not_after` (the too-new rule)
    pub fn oldest_file(
        &self,
        not_after: NaiveDate,
    ) -> io::Result<Option<(NaiveDate, u32, PathBuf)>> {
        Ok(self
            .scan_files()?
            .into_iter()
            .find(|(date, _)| *date <= not_after)
            .map(|(date, suffix)| (date, suffix, self.full_filename(date, suffix))))
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    /// True when the current file should be rotated (size or roll period)
    pub fn rotation_due(&self, now: DateTime<Local>) -> bool {
        if self.current_path.is_none() {
            return false;
        }
        if self.current_size >= self.max_size {
            return true;
        }
        match self.roll_period {
            RollPeriod::Never => false,
            RollPeriod::Hourly => {
                now.date_naive() != self.last_roll.date_naive()
                    || now.hour() != self.last_roll.hour()
            }
            RollPeriod::Daily => {
                now.date_naive() != self.last_roll.date_naive()
                    && (now.hour(), now.minute()) >= (self.roll_hour, self.roll_minute)
            }
        }
    }

    /// True when appending `additional` bytes would push the current file
    /// past `max_size`
    pub fn write_would_overflow(&self, additional: u64) -> bool {
        self.current_size > 0 && self.current_size + additional > self.max_size
    }

    /// Bytes of NUL padding needed so the next message does not straddle a
    /// `chunk_size`-aligned boundary. Zero when chunking is off or the
    /// message is larger than a chunk.
    pub fn bytes_to_pad(message_len: u64, current_size: u64, chunk_size: u64) -> u64 {
        if chunk_size == 0 || message_len > chunk_size {
            return 0;
        }
        let space_left = chunk_size - (current_size % chunk_size);
        if message_len <= space_left {
            0
        } else {
            space_left
        }
    }

    /// Record a successful open of a data file
    pub fn register_open(
        &mut self,
        path: PathBuf,
        date: NaiveDate,
        suffix: u32,
        size: u64,
        now: DateTime<Local>,
    ) {
        self.current_path = Some(path);
        self.current_date = date;
        self.current_suffix = suffix;
        self.current_size = size;
        self.events_written = 0;
        self.last_roll = now;
    }

    /// Account for committed bytes/events in the current file
    pub fn register_write(&mut self, bytes: u64, events: u64) {
        self.current_size += bytes;
        self.events_written += events;
    }

    /// Forget the current file (after close)
    pub fn reset_current(&mut self) {
        self.current_path = None;
        self.current_size = 0;
        self.events_written = 0;
    }

    // ------------------------------------------------------------------
    // Side files
    // ------------------------------------------------------------------

    /// Append one line about a closed file to the stats sidecar.
    /// Best-effort: stats must never interfere with data.
    pub fn record_stats(&self, closed: &Path, size: u64, events: u64) {
        let name = closed
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let line = format!(
            "{} bytes={} events={} closed={}\n",
            name,
            size,
            events,
            Local::now().to_rfc3339()
        );
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stats_path())
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(
                category = %self.category,
                error = %e,
                "failed to append stats line"
            );
        }
    }

    /// Atomically repoint `<base_filename>_current` at `target`
    #[cfg(unix)]
    pub fn update_symlink(&self, target: &Path) -> io::Result<()> {
        let link_target = target
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no name"))?;
        let tmp = self
            .file_path
            .join(format!(".{}_current.tmp", self.base_file_name));
        let _ = fs::remove_file(&tmp);
        std::os::unix::fs::symlink(link_target, &tmp)?;
        fs::rename(&tmp, self.symlink_path())
    }

    #[cfg(not(unix))]
    pub fn update_symlink(&self, _target: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "base_test.rs"]
mod base_test;
