//! Publish orchestration
//!
//! Decides once per cycle what happens to the current reading: replay the
//! backlog first (oldest data has priority), then publish the reading, and
//! fall back to the backlog when that is not possible.

use crate::backlog::{BacklogStore, DrainReport};
use crate::error::{TelemetryError, TelemetryResult};
use crate::health::{Component, HealthSnapshot};
use crate::reading::Reading;
use crate::time::TimeResult;
use crate::traits::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to the current reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Delivered to the collector
    Published,
    /// Stored in the backlog for a later cycle
    Backlogged,
    /// Neither published nor stored
    Lost,
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Successful backlog publishes allowed per cycle
    pub drain_max_items: usize,

    /// Wait before the single retry of a transient failure
    pub transient_retry_delay: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            drain_max_items: 10,
            transient_retry_delay: Duration::from_secs(3),
        }
    }
}

/// Result of one orchestrated cycle
#[derive(Debug)]
pub struct PublishReport {
    pub outcome: CycleOutcome,

    /// Backlog drain result, if a drain ran
    pub drain: Option<DrainReport>,

    /// Health of `network`, `collector`, `mirror` and `storage`
    pub health: HealthSnapshot,

    /// Why the reading was lost, when it was
    pub error: Option<TelemetryError>,
}

/// Publish a reading, retrying once on a transient failure
pub async fn publish_with_retry(
    transport: &dyn Transport,
    reading: &Reading,
    retry_delay: Duration,
) -> TelemetryResult<()> {
    match transport.publish(reading).await {
        Err(e) if e.is_transient() => {
            warn!("{}; retrying in {:?}", e, retry_delay);
            tokio::time::sleep(retry_delay).await;
            transport
                .publish(reading)
                .await
                .map_err(TelemetryError::into_terminal)
        }
        other => other,
    }
}

/// Per-cycle publish / drain / backlog policy
pub struct PublishOrchestrator {
    transport: Arc<dyn Transport>,
    mirror: Option<Arc<dyn Transport>>,
    backlog: BacklogStore,
    config: PublishConfig,
}

impl PublishOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, backlog: BacklogStore, config: PublishConfig) -> Self {
        Self {
            transport,
            mirror: None,
            backlog,
            config,
        }
    }

    /// Also send each current reading, best-effort, to a mirror
    pub fn with_mirror(mut self, mirror: Arc<dyn Transport>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn backlog(&self) -> &BacklogStore {
        &self.backlog
    }

    /// Replay up to `max_items` backlog entries through the transport
    pub async fn drain_backlog(&self, max_items: usize) -> TelemetryResult<DrainReport> {
        let delay = self.config.transient_retry_delay;
        self.backlog
            .drain(max_items, |reading: Reading| {
                let transport = self.transport.clone();
                async move { publish_with_retry(transport.as_ref(), &reading, delay).await }
            })
            .await
    }

    /// Run the publish policy for the current reading
    ///
    /// The reading goes out carrying the network, storage and mirror
    /// health known at that point. A `storage` flag already on the reading
    /// (from the data log) is combined with the backlog results.
    pub async fn run_cycle(&self, reading: &Reading, time: &TimeResult) -> PublishReport {
        let mut health = HealthSnapshot::new();
        if let Some(logged) = reading.component_status().get(Component::Storage) {
            health = health.with(Component::Storage, logged);
        }
        let mut drain = None;
        let mut published = false;

        let connected = self.transport.is_connected().await;
        health = health.with(Component::Network, connected);

        if connected {
            info!("Link is up, checking backlog");
            match self.drain_backlog(self.config.drain_max_items).await {
                Ok(report) => {
                    health = health.and(Component::Storage, true);
                    drain = Some(report);
                }
                Err(e) => {
                    warn!("Backlog drain failed: {}", e);
                    health = health.and(Component::Storage, false);
                }
            }

            if let Some(mirror) = &self.mirror {
                let mirrored = match mirror.publish(reading).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Mirror upload failed: {}", e);
                        false
                    }
                };
                health = health.with(Component::Mirror, mirrored);
            }

            let outgoing = reading
                .clone()
                .with_status(reading.component_status().clone().merge(&health));

            debug!("Publishing reading with {:?} timestamp", time.source);
            match publish_with_retry(
                self.transport.as_ref(),
                &outgoing,
                self.config.transient_retry_delay,
            )
            .await
            {
                Ok(()) => {
                    info!("Reading at {} published", reading.timestamp());
                    published = true;
                }
                Err(e) => warn!("Publish failed: {}", e),
            }
            health = health.with(Component::Collector, published);
        } else {
            warn!("Link is down, skipping upload");
            health = health.with(Component::Collector, false);
            if self.mirror.is_some() {
                health = health.with(Component::Mirror, false);
            }
        }

        if published {
            return PublishReport {
                outcome: CycleOutcome::Published,
                drain,
                health,
                error: None,
            };
        }

        match self.backlog.append(reading) {
            Ok(()) => {
                info!("Reading saved to backlog for later upload");
                PublishReport {
                    outcome: CycleOutcome::Backlogged,
                    drain,
                    health: health.and(Component::Storage, true),
                    error: None,
                }
            }
            Err(e) => {
                error!("Reading lost: not published and backlog unavailable: {}", e);
                PublishReport {
                    outcome: CycleOutcome::Lost,
                    drain,
                    health: health.and(Component::Storage, false),
                    error: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::FsDurableFile;
    use crate::reading::{Particulates, SensorSample, Timestamp};
    use crate::time::{TimeSource, TimeSourceState};
    use crate::traits::{DurableFile, LineWriter, Lines};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn reading(id: i32) -> Reading {
        let sample = SensorSample {
            temperature_c: Some(22.0),
            humidity_pct: Some(40.0),
            particulates: Some(Particulates {
                pm1_0: id,
                pm2_5: 1,
                pm10: 2,
            }),
            v_in: 5.0,
            v_battery: 3.8,
        };
        Reading::new(&sample, Timestamp::Uptime(id as u64), HealthSnapshot::new())
    }

    fn time() -> TimeResult {
        TimeResult {
            timestamp: None,
            source: TimeSource::None,
            state: TimeSourceState::default(),
            health: HealthSnapshot::new(),
        }
    }

    /// Transport answering from a script, defaulting to success
    struct ScriptedTransport {
        connected: bool,
        script: Mutex<VecDeque<TelemetryResult<()>>>,
        attempts: Mutex<Vec<i32>>,
        delivered: Mutex<Vec<i32>>,
        statuses: Mutex<Vec<HealthSnapshot>>,
    }

    impl ScriptedTransport {
        fn new(connected: bool, script: Vec<TelemetryResult<()>>) -> Arc<Self> {
            Arc::new(Self {
                connected,
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn publish(&self, reading: &Reading) -> TelemetryResult<()> {
            self.attempts.lock().push(reading.pm1_0());
            self.statuses.lock().push(reading.component_status().clone());
            let result = self.script.lock().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.delivered.lock().push(reading.pm1_0());
            }
            result
        }
    }

    fn transient() -> TelemetryResult<()> {
        Err(TelemetryError::PublishFailedTransient("503".to_string()))
    }

    fn failed() -> TelemetryResult<()> {
        Err(TelemetryError::PublishFailed("500".to_string()))
    }

    fn orchestrator(dir: &TempDir, transport: Arc<ScriptedTransport>) -> PublishOrchestrator {
        let backlog = BacklogStore::new(Arc::new(FsDurableFile::new()), dir.path().join("backlog.csv"));
        PublishOrchestrator::new(
            transport,
            backlog,
            PublishConfig {
                drain_max_items: 10,
                transient_retry_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_offline_reading_is_backlogged() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(false, vec![]);
        let orch = orchestrator(&dir, transport.clone());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Backlogged);
        assert!(report.drain.is_none());
        assert!(transport.attempts.lock().is_empty());
        assert_eq!(orch.backlog().len().unwrap(), 1);
        assert_eq!(report.health.get(Component::Network), Some(false));
        assert_eq!(report.health.get(Component::Storage), Some(true));
    }

    #[tokio::test]
    async fn test_online_drains_backlog_before_publishing() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![]);
        let orch = orchestrator(&dir, transport.clone());
        orch.backlog().append(&reading(1)).unwrap();
        orch.backlog().append(&reading(2)).unwrap();

        let report = orch.run_cycle(&reading(3), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Published);
        assert_eq!(*transport.delivered.lock(), vec![1, 2, 3]);
        assert_eq!(report.drain.unwrap().published, 2);
        assert!(orch.backlog().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![transient(), Ok(())]);
        let orch = orchestrator(&dir, transport.clone());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Published);
        assert_eq!(*transport.attempts.lock(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_second_transient_failure_is_terminal() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![transient(), transient(), Ok(())]);
        let orch = orchestrator(&dir, transport.clone());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Backlogged);
        assert_eq!(transport.attempts.lock().len(), 2);
        assert_eq!(report.health.get(Component::Collector), Some(false));
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![failed()]);
        let orch = orchestrator(&dir, transport.clone());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Backlogged);
        assert_eq!(transport.attempts.lock().len(), 1);
        assert_eq!(orch.backlog().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backlog_replay_retries_transient_once() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![transient(), Ok(())]);
        let orch = orchestrator(&dir, transport.clone());
        orch.backlog().append(&reading(1)).unwrap();

        let report = orch.drain_backlog(5).await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(*transport.attempts.lock(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_reading_lost_when_storage_unavailable() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(false, vec![]);
        let backlog = BacklogStore::new(
            Arc::new(FsDurableFile::without_dir_creation()),
            dir.path().join("missing").join("backlog.csv"),
        );
        let orch = PublishOrchestrator::new(transport, backlog, PublishConfig::default());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Lost);
        assert!(report.error.unwrap().is_storage_error());
        assert_eq!(report.health.get(Component::Storage), Some(false));
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_backlog() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![]);
        let mirror = ScriptedTransport::new(true, vec![failed()]);
        let orch = orchestrator(&dir, transport).with_mirror(mirror.clone());

        let report = orch.run_cycle(&reading(1), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Published);
        assert_eq!(report.health.get(Component::Mirror), Some(false));
        assert_eq!(mirror.attempts.lock().len(), 1);
        assert!(orch.backlog().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_published_reading_carries_link_and_storage_status() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![]);
        let mirror = ScriptedTransport::new(true, vec![]);
        let orch = orchestrator(&dir, transport.clone()).with_mirror(mirror);

        let logged = reading(1).with_status(
            HealthSnapshot::new()
                .with(Component::TempHumidity, true)
                .with(Component::Storage, true),
        );
        let report = orch.run_cycle(&logged, &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Published);

        let sent = transport.statuses.lock()[0].clone();
        assert_eq!(sent.get(Component::TempHumidity), Some(true));
        assert_eq!(sent.get(Component::Network), Some(true));
        assert_eq!(sent.get(Component::Storage), Some(true));
        assert_eq!(sent.get(Component::Mirror), Some(true));
        assert_eq!(sent.get(Component::Collector), None);
    }

    #[tokio::test]
    async fn test_failed_data_log_is_not_masked_by_backlog() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(false, vec![]);
        let orch = orchestrator(&dir, transport);

        let unlogged = reading(1).with_status(HealthSnapshot::new().with(Component::Storage, false));
        let report = orch.run_cycle(&unlogged, &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Backlogged);
        assert_eq!(report.health.get(Component::Storage), Some(false));
    }

    /// Storage that accepts appends but cannot create the drain's temp file
    struct NoTempFiles(FsDurableFile);

    impl DurableFile for NoTempFiles {
        fn append_raw(&self, path: &Path, bytes: &[u8]) -> TelemetryResult<()> {
            self.0.append_raw(path, bytes)
        }

        fn read_lines(&self, path: &Path) -> TelemetryResult<Lines<'_>> {
            self.0.read_lines(path)
        }

        fn create(&self, path: &Path) -> TelemetryResult<Box<dyn LineWriter + '_>> {
            Err(TelemetryError::storage(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "card full"),
            ))
        }

        fn atomic_replace(&self, path: &Path, replacement: &Path) -> TelemetryResult<()> {
            self.0.atomic_replace(path, replacement)
        }

        fn exists(&self, path: &Path) -> bool {
            self.0.exists(path)
        }

        fn remove(&self, path: &Path) -> TelemetryResult<()> {
            self.0.remove(path)
        }
    }

    #[tokio::test]
    async fn test_drain_failure_survives_successful_append() {
        let dir = tempdir().unwrap();
        let transport = ScriptedTransport::new(true, vec![failed()]);
        let backlog = BacklogStore::new(
            Arc::new(NoTempFiles(FsDurableFile::new())),
            dir.path().join("backlog.csv"),
        );
        backlog.append(&reading(1)).unwrap();
        let orch = PublishOrchestrator::new(transport, backlog, PublishConfig::default());

        let report = orch.run_cycle(&reading(2), &time()).await;
        assert_eq!(report.outcome, CycleOutcome::Backlogged);
        assert!(report.drain.is_none());
        assert_eq!(orch.backlog().len().unwrap(), 2);
        assert_eq!(report.health.get(Component::Storage), Some(false));
    }
}
