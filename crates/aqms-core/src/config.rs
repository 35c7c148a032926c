//! Configuration system for AQMS nodes
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use crate::backlog::CorruptLinePolicy;
use crate::cycle::CycleConfig;
use crate::publish::PublishConfig;
use crate::time::TimeReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node settings
    pub node: NodeSettings,

    /// Duty cycle timing
    pub cycle: CycleSettings,

    /// Time reconciliation
    pub time: TimeSettings,

    /// Local storage
    pub storage: StorageSettings,

    /// Collector upload
    pub uplink: UplinkSettings,

    /// Sensor input
    pub sensor: SensorSettings,
}

/// Node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Duty cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSettings {
    /// Target wake-to-wake period in seconds
    pub period_secs: u64,

    /// Sleep used when a cycle overruns its period, in seconds
    pub min_sleep_secs: u64,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            period_secs: 30 * 60,
            min_sleep_secs: 10,
        }
    }
}

/// Time reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSettings {
    /// NTP server as host:port
    pub ntp_server: String,

    /// Bounded wait for network time in milliseconds
    pub ntp_timeout_ms: u64,

    /// Drift tolerated before the persistent clock is corrected, in seconds
    pub drift_threshold_secs: u64,

    /// File backing the persistent clock (host builds)
    pub clock_path: Option<String>,
}

impl Default for TimeSettings {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org:123".to_string(),
            ntp_timeout_ms: 5000,
            drift_threshold_secs: 5,
            clock_path: None,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding the backlog, data log and clock files
    pub data_dir: String,

    /// Backlog file name, relative to `data_dir`
    pub backlog_file: String,

    /// Primary data log file name, relative to `data_dir`
    pub data_log_file: String,

    /// Write the primary data log
    pub data_log_enabled: bool,

    /// What to do with unparseable backlog lines
    pub corrupt_policy: CorruptLinePolicy,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/aqms-node".to_string(),
            backlog_file: "backlog.csv".to_string(),
            data_log_file: "readings.csv".to_string(),
            data_log_enabled: true,
            corrupt_policy: CorruptLinePolicy::Quarantine,
        }
    }
}

/// Collector upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkSettings {
    /// Collector endpoint receiving JSON readings
    pub collector_url: String,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Connectivity check timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Delay before retrying a transient failure, in milliseconds
    pub transient_retry_delay_ms: u64,

    /// Successful backlog publishes per cycle
    pub drain_max_items: usize,

    /// ThingSpeak mirror
    pub thingspeak: ThingSpeakSettings,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            collector_url: "http://localhost:8000/api/data".to_string(),
            request_timeout_ms: 10000,
            connect_timeout_ms: 3000,
            transient_retry_delay_ms: 3000,
            drain_max_items: 10,
            thingspeak: ThingSpeakSettings::default(),
        }
    }
}

/// ThingSpeak mirror settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThingSpeakSettings {
    /// Enable the mirror
    pub enabled: bool,

    /// Channel write API key
    pub api_key: Option<String>,

    /// API base URL
    pub endpoint: String,
}

impl Default for ThingSpeakSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            endpoint: "http://api.thingspeak.com".to_string(),
        }
    }
}

/// Sensor input settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// JSON file holding the latest acquisition (host builds)
    pub sample_path: Option<String>,
}

impl NodeConfig {
    /// Directory for all node files
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn backlog_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.backlog_file)
    }

    pub fn data_log_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.data_log_file)
    }

    /// Persistent clock file, defaulting to `clock.json` in the data dir
    pub fn clock_path(&self) -> PathBuf {
        self.time
            .clock_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("clock.json"))
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            period: Duration::from_secs(self.cycle.period_secs),
            min_sleep: Duration::from_secs(self.cycle.min_sleep_secs),
        }
    }

    pub fn time_config(&self) -> TimeReconcilerConfig {
        TimeReconcilerConfig {
            network_timeout: Duration::from_millis(self.time.ntp_timeout_ms),
            drift_threshold: Duration::from_secs(self.time.drift_threshold_secs),
        }
    }

    pub fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            drain_max_items: self.uplink.drain_max_items,
            transient_retry_delay: Duration::from_millis(self.uplink.transient_retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.uplink.connect_timeout_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. AQMS_CONFIG environment variable
    /// 3. ~/.config/aqms-node/config.toml
    /// 4. /etc/aqms-node/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<NodeConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            NodeConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("AQMS_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("AQMS_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("aqms-node").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/aqms-node/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<NodeConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut NodeConfig) {
        if let Ok(val) = std::env::var("AQMS_LOG_LEVEL") {
            config.node.log_level = val;
        }
        if let Ok(val) = std::env::var("AQMS_DATA_DIR") {
            config.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("AQMS_CYCLE_PERIOD_SECS") {
            if let Ok(secs) = val.parse() {
                config.cycle.period_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("AQMS_NTP_SERVER") {
            config.time.ntp_server = val;
        }
        if let Ok(val) = std::env::var("AQMS_COLLECTOR_URL") {
            config.uplink.collector_url = val;
        }
        if let Ok(val) = std::env::var("AQMS_THINGSPEAK_API_KEY") {
            config.uplink.thingspeak.api_key = Some(val);
            config.uplink.thingspeak.enabled = true;
        }
    }

    /// Validate configuration
    fn validate(&self, config: &NodeConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.node.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.node.log_level, valid_levels
            )));
        }

        if config.cycle.period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Cycle period cannot be 0".to_string(),
            ));
        }

        if config.cycle.min_sleep_secs > config.cycle.period_secs {
            return Err(ConfigError::ValidationError(format!(
                "Minimum sleep ({}s) exceeds cycle period ({}s)",
                config.cycle.min_sleep_secs, config.cycle.period_secs
            )));
        }

        if config.uplink.drain_max_items == 0 {
            return Err(ConfigError::ValidationError(
                "drain_max_items must be at least 1".to_string(),
            ));
        }

        if config.uplink.thingspeak.enabled && config.uplink.thingspeak.api_key.is_none() {
            return Err(ConfigError::ValidationError(
                "ThingSpeak mirror enabled without an api_key".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
