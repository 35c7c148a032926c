//! Error types for the telemetry pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the telemetry pipeline
///
/// None of these is fatal to the process. Each one maps onto a fallback
/// path: network time falls back to the persistent clock, a failed publish
/// falls back to the backlog, a corrupt backlog line is skipped.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Network time source did not answer in time (or answered garbage)
    #[error("Time unavailable: {0}")]
    TimeUnavailable(String),

    /// Persistent clock could not be read or written
    #[error("Persistent clock unavailable: {0}")]
    ClockUnavailable(String),

    /// Storage medium could not be opened or written
    #[error("Storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single backlog record could not be parsed
    #[error("Corrupt entry at line {line}: {reason}")]
    CorruptEntry { line: usize, reason: String },

    /// Publish failed and must not be retried this cycle
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Remote signalled a transient condition (e.g. service warming up)
    #[error("Publish failed transiently: {0}")]
    PublishFailedTransient(String),
}

impl TelemetryError {
    /// Wrap an IO error with the path it happened on
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TelemetryError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Create a corrupt entry error
    pub fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        TelemetryError::CorruptEntry {
            line,
            reason: reason.into(),
        }
    }

    /// Check if a publish failure is eligible for one immediate retry
    pub fn is_transient(&self) -> bool {
        matches!(self, TelemetryError::PublishFailedTransient(_))
    }

    /// Check if this error concerns the storage medium
    pub fn is_storage_error(&self) -> bool {
        matches!(self, TelemetryError::StorageUnavailable { .. })
    }

    /// Collapse a transient failure into a terminal one
    ///
    /// Used once the single retry budget has been spent.
    pub fn into_terminal(self) -> Self {
        match self {
            TelemetryError::PublishFailedTransient(msg) => TelemetryError::PublishFailed(msg),
            other => other,
        }
    }
}

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;
