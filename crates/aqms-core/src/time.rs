//! Time reconciliation between network time and the persistent clock
//!
//! The persistent clock is the only thing that carries time across deep
//! sleep, so it is corrected opportunistically: only when it reports a
//! power loss or drifts beyond a tolerance from network time. Sub-threshold
//! noise never causes a write, and the clock is written at most once per
//! cycle.

use crate::error::{TelemetryError, TelemetryResult};
use crate::health::{Component, HealthSnapshot};
use crate::reading::Timestamp;
use crate::traits::{ClockReading, NetworkTimeSource, PersistentClock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the cycle's timestamp came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    Network,
    PersistentClock,
    /// No trusted wall-clock; the caller must use the uptime counter
    None,
}

/// Why the persistent clock was last written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionReason {
    #[default]
    None,
    Drift,
    PowerLossRecovery,
}

/// Observable state of the time subsystem after reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSourceState {
    /// Persistent clock value after any correction, if the clock is readable
    pub persistent_clock_value: Option<DateTime<Utc>>,

    /// Correction applied this cycle
    pub last_correction_reason: CorrectionReason,

    /// A trusted wall-clock time is available
    pub trusted: bool,
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeResult {
    /// Trusted wall-clock time, if any
    pub timestamp: Option<DateTime<Utc>>,

    pub source: TimeSource,

    pub state: TimeSourceState,

    /// Health of `time_sync` and `clock`
    pub health: HealthSnapshot,
}

impl TimeResult {
    /// Timestamp for a reading: wall-clock when trusted, else the uptime counter
    pub fn reading_timestamp(&self, uptime: Duration) -> Timestamp {
        match self.timestamp {
            Some(t) if self.state.trusted => Timestamp::WallClock(t),
            _ => Timestamp::Uptime(uptime.as_secs()),
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct TimeReconcilerConfig {
    /// Bounded wait for network time
    pub network_timeout: Duration,

    /// Maximum tolerated difference before the clock is corrected
    pub drift_threshold: Duration,
}

impl Default for TimeReconcilerConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(5),
            drift_threshold: Duration::from_secs(5),
        }
    }
}

/// Produces one trusted point in time per cycle
pub struct TimeReconciler {
    network: Arc<dyn NetworkTimeSource>,
    clock: Arc<dyn PersistentClock>,
    config: TimeReconcilerConfig,
}

impl TimeReconciler {
    pub fn new(
        network: Arc<dyn NetworkTimeSource>,
        clock: Arc<dyn PersistentClock>,
        config: TimeReconcilerConfig,
    ) -> Self {
        Self {
            network,
            clock,
            config,
        }
    }

    async fn fetch_network_time(&self) -> TelemetryResult<DateTime<Utc>> {
        let timeout = self.config.network_timeout;
        match tokio::time::timeout(timeout, self.network.fetch(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::TimeUnavailable(format!(
                "no network time within {:?}",
                timeout
            ))),
        }
    }

    /// Reconcile network time and the persistent clock
    pub async fn reconcile(&self) -> TimeResult {
        let network_time = self.fetch_network_time().await;

        // Read after the network wait so the wait is not counted as drift
        let clock_reading = self.clock.read();
        if let Err(e) = &clock_reading {
            warn!("Persistent clock unreadable: {}", e);
        }

        match network_time {
            Ok(network_time) => {
                info!("Network time acquired: {}", network_time);
                self.reconcile_with_network(network_time, clock_reading)
            }
            Err(e) => {
                warn!("{}; falling back to persistent clock", e);
                Self::fallback(clock_reading)
            }
        }
    }

    fn reconcile_with_network(
        &self,
        network_time: DateTime<Utc>,
        clock_reading: TelemetryResult<ClockReading>,
    ) -> TimeResult {
        let (reason, clock_value) = match clock_reading {
            Ok(reading) if reading.power_lost => {
                info!("Persistent clock lost power, setting it from network time");
                (CorrectionReason::PowerLossRecovery, Some(reading.time))
            }
            Ok(reading) => {
                let drift = (network_time - reading.time).num_seconds();
                if drift.unsigned_abs() > self.config.drift_threshold.as_secs() {
                    info!("Persistent clock drift of {}s, correcting from network time", drift);
                    (CorrectionReason::Drift, Some(reading.time))
                } else {
                    debug!("Persistent clock within {}s of network time, no update", drift);
                    (CorrectionReason::None, Some(reading.time))
                }
            }
            Err(_) => (CorrectionReason::PowerLossRecovery, None),
        };

        let mut clock_ok = clock_value.is_some();
        let mut persistent_clock_value = clock_value;

        if reason != CorrectionReason::None {
            match self.clock.write(network_time) {
                Ok(()) => {
                    clock_ok = true;
                    persistent_clock_value = Some(network_time);
                }
                Err(e) => {
                    warn!("Failed to correct persistent clock: {}", e);
                    clock_ok = false;
                }
            }
        }

        TimeResult {
            timestamp: Some(network_time),
            source: TimeSource::Network,
            state: TimeSourceState {
                persistent_clock_value,
                last_correction_reason: reason,
                trusted: true,
            },
            health: HealthSnapshot::new()
                .with(Component::TimeSync, true)
                .with(Component::Clock, clock_ok),
        }
    }

    fn fallback(clock_reading: TelemetryResult<ClockReading>) -> TimeResult {
        let health = HealthSnapshot::new().with(Component::TimeSync, false);

        match clock_reading {
            Ok(reading) if !reading.power_lost => {
                info!("Using persistent clock time: {}", reading.time);
                TimeResult {
                    timestamp: Some(reading.time),
                    source: TimeSource::PersistentClock,
                    state: TimeSourceState {
                        persistent_clock_value: Some(reading.time),
                        last_correction_reason: CorrectionReason::None,
                        trusted: true,
                    },
                    health: health.with(Component::Clock, true),
                }
            }
            Ok(reading) => {
                warn!("Persistent clock lost power and no network time; using uptime counter");
                TimeResult {
                    timestamp: None,
                    source: TimeSource::None,
                    state: TimeSourceState {
                        persistent_clock_value: Some(reading.time),
                        last_correction_reason: CorrectionReason::None,
                        trusted: false,
                    },
                    health: health.with(Component::Clock, false),
                }
            }
            Err(_) => {
                warn!("No time source available; using uptime counter");
                TimeResult {
                    timestamp: None,
                    source: TimeSource::None,
                    state: TimeSourceState::default(),
                    health: health.with(Component::Clock, false),
                }
            }
        }
    }
}
