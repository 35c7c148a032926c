//! Primary data log
//!
//! Every reading is recorded here regardless of what happens to it
//! upstream. Unlike the backlog, the log carries one header line, written
//! together with the first record so the file is never created headerless.

use crate::error::TelemetryResult;
use crate::reading::{Reading, RECORD_HEADER};
use crate::traits::DurableFile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Append-only CSV record of all readings
pub struct DataLog {
    file: Arc<dyn DurableFile>,
    path: PathBuf,
}

impl DataLog {
    pub fn new(file: Arc<dyn DurableFile>, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one reading
    pub fn record(&self, reading: &Reading) -> TelemetryResult<()> {
        if self.file.exists(&self.path) {
            self.file.append_line(&self.path, &reading.to_record())?;
        } else {
            let first = format!("{}\n{}", RECORD_HEADER, reading.to_record());
            self.file.append_line(&self.path, &first)?;
            info!("Created data log {} with header", self.path.display());
        }
        debug!("Logged reading at {} to {}", reading.timestamp(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::FsDurableFile;
    use crate::health::HealthSnapshot;
    use crate::reading::{SensorSample, Timestamp};
    use tempfile::tempdir;

    fn reading(uptime: u64) -> Reading {
        let sample = SensorSample {
            temperature_c: Some(19.0),
            humidity_pct: Some(61.0),
            v_in: 5.0,
            v_battery: 4.1,
            ..Default::default()
        };
        Reading::new(&sample, Timestamp::Uptime(uptime), HealthSnapshot::new())
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let log = DataLog::new(Arc::new(FsDurableFile::new()), dir.path().join("readings.csv"));

        log.record(&reading(1)).unwrap();
        log.record(&reading(2)).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RECORD_HEADER);
        assert_eq!(lines[1], "up1,19.00,61.00,-1,-1,-1,5.00,4.10");
        assert!(lines[2].starts_with("up2,"));
    }

    #[test]
    fn test_existing_log_is_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readings.csv");
        std::fs::write(&path, format!("{}\n", RECORD_HEADER)).unwrap();

        let log = DataLog::new(Arc::new(FsDurableFile::new()), &path);
        log.record(&reading(7)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(RECORD_HEADER).count(), 1);
        assert!(content.ends_with("up7,19.00,61.00,-1,-1,-1,5.00,4.10\n"));
    }
}
