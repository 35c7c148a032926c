//! Component health snapshots
//!
//! Every pipeline stage returns the health of the components it touched
//! as an immutable [`HealthSnapshot`]. The cycle controller merges them
//! into a single [`StatusReport`]; nothing shares mutable status flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// A node component whose health is reported upward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Temperature / humidity sensor
    TempHumidity,
    /// Particulate matter sensor
    Particulate,
    /// Battery-backed persistent clock
    Clock,
    /// Wireless link / connectivity
    Network,
    /// Network time acquisition
    TimeSync,
    /// Local durable storage
    Storage,
    /// Primary collector upload
    Collector,
    /// Best-effort mirror upload
    Mirror,
}

impl Component {
    /// All components, in report order
    pub const ALL: [Component; 8] = [
        Component::TempHumidity,
        Component::Clock,
        Component::Particulate,
        Component::Network,
        Component::TimeSync,
        Component::Collector,
        Component::Mirror,
        Component::Storage,
    ];

    /// Stable snake_case name
    pub fn name(&self) -> &'static str {
        match self {
            Component::TempHumidity => "temp_humidity",
            Component::Particulate => "particulate",
            Component::Clock => "clock",
            Component::Network => "network",
            Component::TimeSync => "time_sync",
            Component::Storage => "storage",
            Component::Collector => "collector",
            Component::Mirror => "mirror",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable set of component health flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthSnapshot(BTreeMap<Component, bool>);

impl HealthSnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with one flag set
    pub fn with(mut self, component: Component, healthy: bool) -> Self {
        self.0.insert(component, healthy);
        self
    }

    /// Return a copy with one flag combined into any earlier report
    ///
    /// A component already reported as degraded stays degraded.
    pub fn and(mut self, component: Component, healthy: bool) -> Self {
        let entry = self.0.entry(component).or_insert(true);
        *entry = *entry && healthy;
        self
    }

    /// Return a copy with another snapshot layered on top
    ///
    /// Flags in `other` win over flags already present.
    pub fn merge(mut self, other: &HealthSnapshot) -> Self {
        for (component, healthy) in &other.0 {
            self.0.insert(*component, *healthy);
        }
        self
    }

    /// Health of one component, `None` if it was never reported
    pub fn get(&self, component: Component) -> Option<bool> {
        self.0.get(&component).copied()
    }

    /// Iterate over reported components
    pub fn iter(&self) -> impl Iterator<Item = (Component, bool)> + '_ {
        self.0.iter().map(|(c, h)| (*c, *h))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Aggregated status for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Final health of every reported component
    pub health: HealthSnapshot,

    /// The current reading could neither be published nor stored
    pub reading_lost: bool,
}

impl StatusReport {
    pub fn new(health: HealthSnapshot, reading_lost: bool) -> Self {
        Self {
            health,
            reading_lost,
        }
    }

    /// Components reported unhealthy
    pub fn degraded(&self) -> Vec<Component> {
        self.health
            .iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(c, _)| c)
            .collect()
    }

    /// Emit the report through tracing, one line per component
    pub fn log(&self) {
        info!("===== DEVICE STATUS =====");
        for component in Component::ALL {
            let state = match self.health.get(component) {
                Some(true) => "OK",
                Some(false) => "FAILED",
                None => "N/A",
            };
            info!("{:<14}: {}", component.name(), state);
        }
        if self.reading_lost {
            info!("{:<14}: {}", "reading", "LOST");
        }
        info!("=========================");
    }
}
