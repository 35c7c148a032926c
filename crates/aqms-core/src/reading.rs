//! Reading value type and its backlog record encoding
//!
//! A [`Reading`] captures one sampling cycle. It is never partially
//! constructed: a failed sub-reading is stored as a sentinel (`NaN` for
//! floats, [`PM_INVALID`] for particulate counts) so every consumer sees
//! the same fixed schema.
//!
//! ## Record format
//!
//! ```text
//! timestamp_or_counter,temperature,humidity,pm1_0,pm2_5,pm10,v_in,v_battery
//! ```
//!
//! Wall-clock timestamps are bare epoch seconds. Uptime counters carry an
//! `up` prefix so the two units can never be confused on replay.

use crate::error::{TelemetryError, TelemetryResult};
use crate::health::{Component, HealthSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for an invalid particulate reading
pub const PM_INVALID: i32 = -1;

/// Number of comma-separated fields in a record
pub const RECORD_FIELDS: usize = 8;

/// Header line of the primary data log
pub const RECORD_HEADER: &str = "timestamp,temperature,humidity,pm1_0,pm2_5,pm10,v_in,v_battery";

const UPTIME_PREFIX: &str = "up";
const INVALID_FLOAT: &str = "nan";

/// When a reading was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    /// Trusted wall-clock time (network or persistent clock)
    WallClock(DateTime<Utc>),
    /// Seconds of device uptime; used when no clock could be trusted
    Uptime(u64),
}

impl Timestamp {
    pub fn is_wall_clock(&self) -> bool {
        matches!(self, Timestamp::WallClock(_))
    }

    /// Epoch seconds, only for wall-clock timestamps
    pub fn epoch_seconds(&self) -> Option<i64> {
        match self {
            Timestamp::WallClock(t) => Some(t.timestamp()),
            Timestamp::Uptime(_) => None,
        }
    }

    fn encode(&self) -> String {
        match self {
            Timestamp::WallClock(t) => t.timestamp().to_string(),
            Timestamp::Uptime(secs) => format!("{}{}", UPTIME_PREFIX, secs),
        }
    }

    fn decode(field: &str) -> Result<Self, String> {
        if let Some(counter) = field.strip_prefix(UPTIME_PREFIX) {
            return counter
                .parse::<u64>()
                .map(Timestamp::Uptime)
                .map_err(|e| format!("invalid uptime counter {:?}: {}", field, e));
        }

        let secs = field
            .parse::<i64>()
            .map_err(|e| format!("invalid timestamp {:?}: {}", field, e))?;
        DateTime::<Utc>::from_timestamp(secs, 0)
            .map(Timestamp::WallClock)
            .ok_or_else(|| format!("timestamp out of range: {}", secs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::WallClock(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S UTC")),
            Timestamp::Uptime(secs) => write!(f, "uptime+{}s", secs),
        }
    }
}

/// Particulate concentrations in µg/m³
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Particulates {
    pub pm1_0: i32,
    pub pm2_5: i32,
    pub pm10: i32,
}

/// Raw outputs of one sensor acquisition, before timestamping
///
/// Values are already validated and calibrated by the sensor layer.
/// `None` means the sensor failed to produce a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSample {
    pub temperature_c: Option<f32>,
    pub humidity_pct: Option<f32>,
    pub particulates: Option<Particulates>,
    pub v_in: f32,
    pub v_battery: f32,
}

impl SensorSample {
    /// Health of the sensors that produced this sample
    pub fn health(&self) -> HealthSnapshot {
        let th_ok = matches!(
            (self.temperature_c, self.humidity_pct),
            (Some(t), Some(h)) if t.is_finite() && h.is_finite()
        );
        HealthSnapshot::new()
            .with(Component::TempHumidity, th_ok)
            .with(Component::Particulate, self.particulates.is_some())
    }
}

/// One complete, immutable sampling-cycle reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    timestamp: Timestamp,
    temperature_c: f32,
    humidity_pct: f32,
    pm1_0: i32,
    pm2_5: i32,
    pm10: i32,
    v_in: f32,
    v_battery: f32,
    component_status: HealthSnapshot,
}

impl Reading {
    /// Build a reading from a sensor sample
    ///
    /// Missing values become sentinels; non-finite floats are normalized to
    /// `NaN`.
    pub fn new(sample: &SensorSample, timestamp: Timestamp, component_status: HealthSnapshot) -> Self {
        let pm = sample.particulates.unwrap_or(Particulates {
            pm1_0: PM_INVALID,
            pm2_5: PM_INVALID,
            pm10: PM_INVALID,
        });

        Self {
            timestamp,
            temperature_c: sanitize(sample.temperature_c.unwrap_or(f32::NAN)),
            humidity_pct: sanitize(sample.humidity_pct.unwrap_or(f32::NAN)),
            pm1_0: pm.pm1_0,
            pm2_5: pm.pm2_5,
            pm10: pm.pm10,
            v_in: sanitize(sample.v_in),
            v_battery: sanitize(sample.v_battery),
            component_status,
        }
    }

    /// Return a copy carrying a different component status
    pub fn with_status(mut self, component_status: HealthSnapshot) -> Self {
        self.component_status = component_status;
        self
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn temperature_c(&self) -> f32 {
        self.temperature_c
    }

    pub fn humidity_pct(&self) -> f32 {
        self.humidity_pct
    }

    pub fn pm1_0(&self) -> i32 {
        self.pm1_0
    }

    pub fn pm2_5(&self) -> i32 {
        self.pm2_5
    }

    pub fn pm10(&self) -> i32 {
        self.pm10
    }

    pub fn v_in(&self) -> f32 {
        self.v_in
    }

    pub fn v_battery(&self) -> f32 {
        self.v_battery
    }

    /// Component health captured alongside the reading
    ///
    /// Empty for readings replayed from the backlog, whose record format
    /// carries no health flags.
    pub fn component_status(&self) -> &HealthSnapshot {
        &self.component_status
    }

    /// Encode as one backlog/data-log record (no trailing newline)
    pub fn to_record(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.timestamp.encode(),
            encode_float(self.temperature_c),
            encode_float(self.humidity_pct),
            self.pm1_0,
            self.pm2_5,
            self.pm10,
            encode_float(self.v_in),
            encode_float(self.v_battery),
        )
    }

    /// Decode one record
    ///
    /// `line_no` is only used for error reporting.
    pub fn from_record(record: &str, line_no: usize) -> TelemetryResult<Self> {
        let fields: Vec<&str> = record.trim_end_matches('\r').split(',').collect();
        if fields.len() != RECORD_FIELDS {
            return Err(TelemetryError::corrupt(
                line_no,
                format!("expected {} fields, found {}", RECORD_FIELDS, fields.len()),
            ));
        }

        let corrupt = |reason: String| TelemetryError::corrupt(line_no, reason);

        Ok(Self {
            timestamp: Timestamp::decode(fields[0]).map_err(corrupt)?,
            temperature_c: decode_float(fields[1]).map_err(corrupt)?,
            humidity_pct: decode_float(fields[2]).map_err(corrupt)?,
            pm1_0: decode_int(fields[3]).map_err(corrupt)?,
            pm2_5: decode_int(fields[4]).map_err(corrupt)?,
            pm10: decode_int(fields[5]).map_err(corrupt)?,
            v_in: decode_float(fields[6]).map_err(corrupt)?,
            v_battery: decode_float(fields[7]).map_err(corrupt)?,
            component_status: HealthSnapshot::new(),
        })
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        f32::NAN
    }
}

fn encode_float(value: f32) -> String {
    if value.is_finite() {
        format!("{:.2}", value)
    } else {
        INVALID_FLOAT.to_string()
    }
}

fn decode_float(field: &str) -> Result<f32, String> {
    if field.eq_ignore_ascii_case(INVALID_FLOAT) {
        return Ok(f32::NAN);
    }
    match field.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err(format!("non-finite value {:?}", field)),
        Err(e) => Err(format!("invalid number {:?}: {}", field, e)),
    }
}

fn decode_int(field: &str) -> Result<i32, String> {
    field
        .parse::<i32>()
        .map_err(|e| format!("invalid integer {:?}: {}", field, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SensorSample {
        SensorSample {
            temperature_c: Some(21.5),
            humidity_pct: Some(48.25),
            particulates: Some(Particulates {
                pm1_0: 7,
                pm2_5: 12,
                pm10: 19,
            }),
            v_in: 5.02,
            v_battery: 3.91,
        }
    }

    fn wall_clock(secs: i64) -> Timestamp {
        Timestamp::WallClock(DateTime::<Utc>::from_timestamp(secs, 0).unwrap())
    }

    #[test]
    fn test_record_layout() {
        let reading = Reading::new(&sample(), wall_clock(1_718_000_000), HealthSnapshot::new());
        assert_eq!(
            reading.to_record(),
            "1718000000,21.50,48.25,7,12,19,5.02,3.91"
        );
    }

    #[test]
    fn test_missing_values_become_sentinels() {
        let sample = SensorSample {
            v_in: 4.8,
            v_battery: f32::INFINITY,
            ..Default::default()
        };
        let reading = Reading::new(&sample, Timestamp::Uptime(42), HealthSnapshot::new());

        assert!(reading.temperature_c().is_nan());
        assert!(reading.humidity_pct().is_nan());
        assert_eq!(reading.pm2_5(), PM_INVALID);
        assert!(reading.v_battery().is_nan());
        assert_eq!(reading.to_record(), "up42,nan,nan,-1,-1,-1,4.80,nan");
    }

    #[test]
    fn test_decode_keeps_timestamp_kind() {
        let wall = Reading::from_record("1718000000,21.50,48.25,7,12,19,5.02,3.91", 1).unwrap();
        assert_eq!(wall.timestamp(), wall_clock(1_718_000_000));

        let uptime = Reading::from_record("up42,nan,nan,-1,-1,-1,4.80,nan", 2).unwrap();
        assert_eq!(uptime.timestamp(), Timestamp::Uptime(42));
        assert!(uptime.temperature_c().is_nan());
        assert!(uptime.component_status().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let err = Reading::from_record("1718000000,21.50,48.25", 5).unwrap_err();
        assert!(matches!(err, TelemetryError::CorruptEntry { line: 5, .. }));

        assert!(Reading::from_record("yesterday,1,1,1,1,1,1,1", 1).is_err());
        assert!(Reading::from_record("up-3,1,1,1,1,1,1,1", 1).is_err());
        assert!(Reading::from_record("1,1,1,1.5,1,1,1,1", 1).is_err());
        assert!(Reading::from_record("1,inf,1,1,1,1,1,1", 1).is_err());
    }

    #[test]
    fn test_sample_health() {
        let health = sample().health();
        assert_eq!(health.get(Component::TempHumidity), Some(true));
        assert_eq!(health.get(Component::Particulate), Some(true));

        let health = SensorSample {
            temperature_c: Some(f32::NAN),
            humidity_pct: Some(40.0),
            ..Default::default()
        }
        .health();
        assert_eq!(health.get(Component::TempHumidity), Some(false));
        assert_eq!(health.get(Component::Particulate), Some(false));
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(wall_clock(0).to_string(), "1970-01-01 00:00:00 UTC");
        assert_eq!(Timestamp::Uptime(9).to_string(), "uptime+9s");
    }
}
