//! Error types for aqms-uplink crate

use aqms_core::TelemetryError;
use thiserror::Error;

/// Errors that can occur talking to the outside world
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Remote reported a temporary condition (HTTP 503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Remote rejected the request
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Malformed or unusable NTP response
    #[error("NTP error: {0}")]
    Ntp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,
}

impl UplinkError {
    /// Check if a retry in the same cycle may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, UplinkError::Unavailable(_))
    }

    /// Create a server error from status and message
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        UplinkError::Server {
            status,
            message: message.into(),
        }
    }
}

impl From<UplinkError> for TelemetryError {
    fn from(err: UplinkError) -> Self {
        if err.is_transient() {
            TelemetryError::PublishFailedTransient(err.to_string())
        } else {
            TelemetryError::PublishFailed(err.to_string())
        }
    }
}

/// Result type for uplink operations
pub type UplinkResult<T> = Result<T, UplinkError>;
