//! Cycle controller
//!
//! Sequences one wake cycle (sample, reconcile time, log, publish or
//! backlog) and computes how long to sleep to keep the configured period.
//! Durations are measured on the uptime counter only, never on the
//! wall-clock.

use crate::backlog::DrainReport;
use crate::data_log::DataLog;
use crate::health::{Component, HealthSnapshot, StatusReport};
use crate::publish::{CycleOutcome, PublishOrchestrator};
use crate::reading::Reading;
use crate::time::{TimeReconciler, TimeResult};
use crate::traits::{SensorSource, Uptime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Cycle timing settings
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Target wake-to-wake period
    pub period: Duration,

    /// Sleep used when the cycle overran its period
    pub min_sleep: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30 * 60),
            min_sleep: Duration::from_secs(10),
        }
    }
}

/// Sleep needed to complete `period` after `active` time awake
///
/// Falls back to `min_sleep` once the period is used up so the device
/// always schedules a wake-up.
pub fn sleep_budget(period: Duration, active: Duration, min_sleep: Duration) -> Duration {
    if active < period {
        period - active
    } else {
        min_sleep
    }
}

/// Everything that happened in one cycle
#[derive(Debug)]
pub struct CycleReport {
    pub reading: Reading,
    pub time: TimeResult,
    pub outcome: CycleOutcome,
    pub drain: Option<DrainReport>,
    pub status: StatusReport,
    pub active_time: Duration,
    pub sleep_time: Duration,
}

/// Top-level per-cycle policy
pub struct CycleController {
    sensors: Arc<dyn SensorSource>,
    time: TimeReconciler,
    orchestrator: PublishOrchestrator,
    data_log: Option<DataLog>,
    uptime: Arc<dyn Uptime>,
    config: CycleConfig,
}

impl CycleController {
    pub fn new(
        sensors: Arc<dyn SensorSource>,
        time: TimeReconciler,
        orchestrator: PublishOrchestrator,
        uptime: Arc<dyn Uptime>,
        config: CycleConfig,
    ) -> Self {
        Self {
            sensors,
            time,
            orchestrator,
            data_log: None,
            uptime,
            config,
        }
    }

    /// Record every reading to a primary data log as well
    pub fn with_data_log(mut self, data_log: DataLog) -> Self {
        self.data_log = Some(data_log);
        self
    }

    pub fn orchestrator(&self) -> &PublishOrchestrator {
        &self.orchestrator
    }

    /// Run one complete cycle
    pub async fn run(&self) -> CycleReport {
        let start = self.uptime.uptime();
        info!("Cycle started at uptime {:?}", start);

        let sample = self.sensors.sample().await;
        let sensor_health = sample.health();

        let time = self.time.reconcile().await;
        let timestamp = time.reading_timestamp(self.uptime.uptime());
        let mut reading = Reading::new(&sample, timestamp, sensor_health.merge(&time.health));
        info!("Reading taken at {}", reading.timestamp());

        if let Some(log) = &self.data_log {
            let logged = match log.record(&reading) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to write data log: {}", e);
                    false
                }
            };
            let status = reading.component_status().clone().with(Component::Storage, logged);
            reading = reading.with_status(status);
        }

        let publish = self.orchestrator.run_cycle(&reading, &time).await;

        let health: HealthSnapshot = reading.component_status().clone().merge(&publish.health);
        let status = StatusReport::new(health, publish.outcome == CycleOutcome::Lost);

        let active_time = self.uptime.uptime().saturating_sub(start);
        let sleep_time = sleep_budget(self.config.period, active_time, self.config.min_sleep);
        info!(
            "Active time: {:.2}s | sleeping for {:.2}s",
            active_time.as_secs_f64(),
            sleep_time.as_secs_f64()
        );

        CycleReport {
            reading,
            time,
            outcome: publish.outcome,
            drain: publish.drain,
            status,
            active_time,
            sleep_time,
        }
    }
}
