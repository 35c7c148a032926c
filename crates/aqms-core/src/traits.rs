//! Collaborator interfaces consumed by the pipeline
//!
//! Sensors, the network, the clock chip and the storage medium all sit
//! behind these traits. The pipeline only sees validated values and
//! tagged outcomes.

use crate::error::{TelemetryError, TelemetryResult};
use crate::reading::{Reading, SensorSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

/// Source of calibrated sensor values
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Take one sample of every sensor
    async fn sample(&self) -> SensorSample;
}

/// Source of network (NTP-style) wall-clock time
#[async_trait]
pub trait NetworkTimeSource: Send + Sync {
    /// Fetch the current time, failing with `TimeUnavailable` after `timeout`
    async fn fetch(&self, timeout: Duration) -> TelemetryResult<DateTime<Utc>>;
}

/// One read of the persistent clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    /// Current clock value
    pub time: DateTime<Utc>,

    /// The clock lost its backup power and the value is meaningless
    pub power_lost: bool,
}

/// Battery-backed clock that survives deep sleep
pub trait PersistentClock: Send + Sync {
    /// Read the clock, failing with `ClockUnavailable` if the chip is absent
    fn read(&self) -> TelemetryResult<ClockReading>;

    /// Set the clock; clears any power-loss condition
    fn write(&self, time: DateTime<Utc>) -> TelemetryResult<()>;
}

/// Link to the remote collector
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// Publish one reading
    ///
    /// Returns `PublishFailedTransient` when the remote explicitly reports
    /// a temporary condition, `PublishFailed` for anything else.
    async fn publish(&self, reading: &Reading) -> TelemetryResult<()>;
}

/// Sink for lines written to a fresh file
pub trait LineWriter: Send {
    /// Write one line of raw bytes; a newline is appended
    fn write_raw(&mut self, bytes: &[u8]) -> TelemetryResult<()>;

    /// Write one line; a newline is appended
    fn write_line(&mut self, line: &str) -> TelemetryResult<()> {
        self.write_raw(line.as_bytes())
    }

    /// Flush and make the file durable
    fn finish(self: Box<Self>) -> TelemetryResult<()>;
}

/// One line as stored, without its newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// 1-based line number
    pub line_no: usize,

    pub bytes: Vec<u8>,

    /// False for a final line cut off by a torn write
    pub terminated: bool,
}

impl RawLine {
    /// Decode the line, failing with `CorruptEntry` if it is unterminated or not UTF-8
    pub fn text(&self) -> TelemetryResult<&str> {
        if !self.terminated {
            return Err(TelemetryError::corrupt(
                self.line_no,
                "unterminated line (torn write)",
            ));
        }
        std::str::from_utf8(&self.bytes)
            .map_err(|_| TelemetryError::corrupt(self.line_no, "invalid UTF-8"))
    }

    /// Whether the line holds nothing but whitespace
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(u8::is_ascii_whitespace)
    }
}

/// Lazy sequence of lines; only a failing medium yields an error
pub type Lines<'a> = Box<dyn Iterator<Item = TelemetryResult<RawLine>> + Send + 'a>;

/// Line-oriented durable storage
///
/// Every mutation must be crash-safe on its own: an append is a single
/// write of one complete line and `atomic_replace` swaps whole files.
pub trait DurableFile: Send + Sync {
    /// Append one complete line of raw bytes (the newline is added)
    fn append_raw(&self, path: &Path, bytes: &[u8]) -> TelemetryResult<()>;

    /// Append one complete line (the newline is added)
    fn append_line(&self, path: &Path, line: &str) -> TelemetryResult<()> {
        self.append_raw(path, line.as_bytes())
    }

    /// Read lines sequentially from the start; a missing file yields nothing
    fn read_lines(&self, path: &Path) -> TelemetryResult<Lines<'_>>;

    /// Create (truncating) a file for sequential writing
    fn create(&self, path: &Path) -> TelemetryResult<Box<dyn LineWriter + '_>>;

    /// Atomically replace `path` with `replacement`
    fn atomic_replace(&self, path: &Path, replacement: &Path) -> TelemetryResult<()>;

    /// Whether `path` exists
    fn exists(&self, path: &Path) -> bool;

    /// Remove `path` if it exists
    fn remove(&self, path: &Path) -> TelemetryResult<()>;
}

/// Monotonic device uptime, independent of wall-clock time
pub trait Uptime: Send + Sync {
    fn uptime(&self) -> Duration;
}
