//! Host-side stand-ins for the node hardware
//!
//! On a Linux gateway there is no RTC chip or sensor bus to talk to, so the
//! clock is kept in a small JSON file and sensor values are read from a
//! JSON file written by an acquisition process.

use aqms_core::{
    ClockReading, PersistentClock, SensorSample, SensorSource, TelemetryError, TelemetryResult,
    Uptime,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// On-disk clock state
#[derive(Debug, Serialize, Deserialize)]
struct ClockState {
    /// Clock value minus system time, in milliseconds
    offset_ms: i64,
}

/// Persistent clock backed by a file
///
/// The file stores the clock's offset from the system time. A missing
/// file plays the part of a clock whose backup battery ran out.
pub struct FileClock {
    path: PathBuf,
}

impl FileClock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> TelemetryError {
        TelemetryError::ClockUnavailable(format!("{}: {}", self.path.display(), e))
    }
}

impl PersistentClock for FileClock {
    fn read(&self) -> TelemetryResult<ClockReading> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No clock file at {}, reporting power loss", self.path.display());
                return Ok(ClockReading {
                    time: DateTime::<Utc>::UNIX_EPOCH,
                    power_lost: true,
                });
            }
            Err(e) => return Err(self.unavailable(e)),
        };

        let state: ClockState = serde_json::from_str(&content).map_err(|e| self.unavailable(e))?;
        Ok(ClockReading {
            time: Utc::now() + ChronoDuration::milliseconds(state.offset_ms),
            power_lost: false,
        })
    }

    fn write(&self, time: DateTime<Utc>) -> TelemetryResult<()> {
        let state = ClockState {
            offset_ms: (time - Utc::now()).num_milliseconds(),
        };
        let json = serde_json::to_string(&state).map_err(|e| self.unavailable(e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.unavailable(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, json).map_err(|e| self.unavailable(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.unavailable(e))?;
        Ok(())
    }
}

/// Sensor values read from a JSON file
///
/// Without a file every sensor is reported as failed.
pub struct JsonFileSensor {
    path: Option<PathBuf>,
}

impl JsonFileSensor {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SensorSource for JsonFileSensor {
    async fn sample(&self) -> SensorSample {
        let Some(path) = &self.path else {
            warn!("No sensor sample file configured");
            return SensorSample::default();
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read sensor sample {}: {}", path.display(), e);
                return SensorSample::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Invalid sensor sample {}: {}", path.display(), e);
                SensorSample::default()
            }
        }
    }
}

/// Process uptime
pub struct SystemUptime {
    started: Instant,
}

impl SystemUptime {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemUptime {
    fn default() -> Self {
        Self::new()
    }
}

impl Uptime for SystemUptime {
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
