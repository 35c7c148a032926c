//! Durable backlog of unsent readings
//!
//! The backlog is a flat, newline-delimited file of reading records in
//! FIFO order. There is no in-memory index: every cycle starts from the
//! file alone.
//!
//! ## Crash consistency
//!
//! - `append` is one write of one complete line.
//! - `drain` never edits the backlog in place. It streams the entries it
//!   keeps into `<backlog>.tmp` and swaps that file over the original in
//!   one atomic replace. Losing power before the swap leaves the original
//!   untouched and the whole drain is retried next cycle, so delivery is
//!   at-least-once.

use crate::error::{TelemetryError, TelemetryResult};
use crate::reading::Reading;
use crate::traits::{DurableFile, LineWriter};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happens to a backlog line that cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptLinePolicy {
    /// Drop the line and report it
    Drop,
    /// Move the line verbatim into `<backlog>.corrupt`, then drop it
    #[default]
    Quarantine,
}

/// Outcome of one bounded drain
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Entries published and removed from the backlog
    pub published: usize,

    /// Entries whose publish failed; kept for the next cycle
    pub failed: usize,

    /// Entries left untouched because the publish budget was spent
    pub deferred: usize,

    /// Lines dropped as unparseable
    pub corrupt: Vec<TelemetryError>,
}

impl DrainReport {
    /// Entries still in the backlog after the drain
    pub fn remaining(&self) -> usize {
        self.failed + self.deferred
    }
}

/// Append-only durable queue of readings
pub struct BacklogStore {
    file: Arc<dyn DurableFile>,
    path: PathBuf,
    policy: CorruptLinePolicy,
}

impl BacklogStore {
    /// Create a store over `path`
    pub fn new(file: Arc<dyn DurableFile>, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
            policy: CorruptLinePolicy::default(),
        }
    }

    /// Set the corrupt line policy
    pub fn with_policy(mut self, policy: CorruptLinePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the temporary file used by `drain`
    pub fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    /// Path of the quarantine file for corrupt lines
    pub fn quarantine_path(&self) -> PathBuf {
        sibling(&self.path, "corrupt")
    }

    /// Append one reading at the tail
    pub fn append(&self, reading: &Reading) -> TelemetryResult<()> {
        self.file.append_line(&self.path, &reading.to_record())?;
        debug!(
            "Appended reading at {} to backlog {}",
            reading.timestamp(),
            self.path.display()
        );
        Ok(())
    }

    /// Number of entries currently in the backlog
    ///
    /// Counts every non-empty line, including ones that would fail to parse.
    pub fn len(&self) -> TelemetryResult<usize> {
        let mut count = 0;
        for line in self.file.read_lines(&self.path)? {
            if !line?.is_blank() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> TelemetryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Publish up to `max_items` entries, oldest first
    ///
    /// Every entry is offered to `publish` in order until `max_items`
    /// publishes have succeeded; after that the rest is carried over
    /// unread. A failed publish keeps its entry and moves on to the next
    /// one. The backlog is only rewritten once the whole file has been
    /// scanned.
    pub async fn drain<F, Fut>(&self, max_items: usize, mut publish: F) -> TelemetryResult<DrainReport>
    where
        F: FnMut(Reading) -> Fut,
        Fut: Future<Output = TelemetryResult<()>>,
    {
        if !self.file.exists(&self.path) {
            debug!("No backlog at {}, nothing to drain", self.path.display());
            return Ok(DrainReport::default());
        }

        let tmp = self.temp_path();
        // Leftover from a drain that lost power before its swap.
        self.file.remove(&tmp)?;

        let mut writer = self.file.create(&tmp)?;
        let report = match self.scan(max_items, &mut publish, writer.as_mut()).await {
            Ok(report) => report,
            Err(e) => {
                drop(writer);
                self.discard_temp(&tmp);
                return Err(e);
            }
        };

        if let Err(e) = writer.finish() {
            self.discard_temp(&tmp);
            return Err(e);
        }
        self.file.atomic_replace(&self.path, &tmp)?;

        info!(
            "Backlog drain: {} published, {} failed, {} deferred, {} corrupt",
            report.published,
            report.failed,
            report.deferred,
            report.corrupt.len()
        );
        Ok(report)
    }

    async fn scan<F, Fut>(
        &self,
        max_items: usize,
        publish: &mut F,
        writer: &mut dyn LineWriter,
    ) -> TelemetryResult<DrainReport>
    where
        F: FnMut(Reading) -> Fut,
        Fut: Future<Output = TelemetryResult<()>>,
    {
        let mut report = DrainReport::default();

        for item in self.file.read_lines(&self.path)? {
            let raw = item?;
            if raw.is_blank() {
                continue;
            }

            if report.published >= max_items {
                writer.write_raw(&raw.bytes)?;
                report.deferred += 1;
                continue;
            }

            let reading = match raw
                .text()
                .and_then(|line| Reading::from_record(line, raw.line_no))
            {
                Ok(reading) => reading,
                Err(e) => {
                    self.handle_corrupt(&raw.bytes, &e);
                    report.corrupt.push(e);
                    continue;
                }
            };

            match publish(reading).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    debug!("Backlog entry {} kept: {}", raw.line_no, e);
                    writer.write_raw(&raw.bytes)?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    fn handle_corrupt(&self, bytes: &[u8], err: &TelemetryError) {
        match self.policy {
            CorruptLinePolicy::Drop => {
                warn!("Dropping corrupt backlog entry: {}", err);
            }
            CorruptLinePolicy::Quarantine => {
                let quarantine = self.quarantine_path();
                match self.file.append_raw(&quarantine, bytes) {
                    Ok(()) => warn!(
                        "Moved corrupt backlog entry to {}: {}",
                        quarantine.display(),
                        err
                    ),
                    Err(qe) => error!(
                        "Failed to quarantine corrupt entry ({}), dropping it: {}",
                        qe, err
                    ),
                }
            }
        }
    }

    fn discard_temp(&self, tmp: &Path) {
        if let Err(e) = self.file.remove(tmp) {
            warn!("Failed to remove {}: {}", tmp.display(), e);
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
