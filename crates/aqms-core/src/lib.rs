//! AQMS Core - Offline-first telemetry pipeline
//!
//! This crate holds everything a node does in one wake cycle, independent
//! of the hardware and network stack it runs on:
//!
//! - **Reading**: validated sensor values and their durable record encoding
//! - **Time**: reconciliation of network time with the persistent clock
//! - **Backlog**: crash-safe FIFO of unsent readings with bounded drain
//! - **Publish**: backlog replay, single transient retry and fallback storage
//! - **Cycle**: per-wake sequencing and sleep budgeting
//! - **Config**: TOML configuration with env overrides

pub mod backlog;
pub mod config;
pub mod cycle;
pub mod data_log;
pub mod durable;
pub mod error;
pub mod health;
pub mod publish;
pub mod reading;
pub mod time;
pub mod traits;

// Re-export commonly used types
pub use backlog::{BacklogStore, CorruptLinePolicy, DrainReport};
pub use config::{ConfigError, ConfigLoader, NodeConfig};
pub use cycle::{sleep_budget, CycleConfig, CycleController, CycleReport};
pub use data_log::DataLog;
pub use durable::FsDurableFile;
pub use error::{TelemetryError, TelemetryResult};
pub use health::{Component, HealthSnapshot, StatusReport};
pub use publish::{publish_with_retry, CycleOutcome, PublishConfig, PublishOrchestrator, PublishReport};
pub use reading::{Particulates, Reading, SensorSample, Timestamp};
pub use time::{CorrectionReason, TimeReconciler, TimeReconcilerConfig, TimeResult, TimeSource, TimeSourceState};
pub use traits::{
    ClockReading, DurableFile, LineWriter, NetworkTimeSource, PersistentClock, RawLine, SensorSource,
    Transport, Uptime,
};

/// Node firmware version
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");
