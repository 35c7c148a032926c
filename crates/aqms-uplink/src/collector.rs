//! HTTP client for the AQMS collector
//!
//! Readings are POSTed one at a time as JSON. The collector's hosting
//! platform answers 503 while it spins up, which is the only response
//! treated as transient.

use crate::error::{UplinkError, UplinkResult};
use aqms_core::{Component, Reading, TelemetryResult, Transport};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};
use url::Url;

/// Collector schema key for a component flag
fn wire_key(component: Component) -> Option<&'static str> {
    match component {
        Component::TempHumidity => Some("aht20"),
        Component::Particulate => Some("pms7003"),
        Component::Clock => Some("rtc"),
        Component::Network => Some("wifi"),
        Component::TimeSync => Some("ntp"),
        Component::Storage => Some("sdcard"),
        Component::Mirror => Some("thingspeak"),
        Component::Collector => None,
    }
}

fn finite(value: f32) -> Option<f32> {
    value.is_finite().then_some(value)
}

/// JSON body accepted by the collector
#[derive(Debug, Serialize)]
struct CollectorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
    temp: Option<f32>,
    hum: Option<f32>,
    pm1: i32,
    pm25: i32,
    pm10: i32,
    vin: Option<f32>,
    battery: Option<f32>,
    #[serde(flatten)]
    status: BTreeMap<&'static str, bool>,
}

impl From<&Reading> for CollectorPayload {
    fn from(reading: &Reading) -> Self {
        let status = reading
            .component_status()
            .iter()
            .filter_map(|(component, ok)| wire_key(component).map(|key| (key, ok)))
            .collect();

        Self {
            ts: reading.timestamp().epoch_seconds(),
            temp: finite(reading.temperature_c()),
            hum: finite(reading.humidity_pct()),
            pm1: reading.pm1_0(),
            pm25: reading.pm2_5(),
            pm10: reading.pm10(),
            vin: finite(reading.v_in()),
            battery: finite(reading.v_battery()),
            status,
        }
    }
}

/// Collector transport
pub struct CollectorClient {
    client: Client,
    url: Url,
    connect_timeout: Duration,
}

impl CollectorClient {
    /// Create a new collector client
    pub fn new(url: &str, request_timeout: Duration, connect_timeout: Duration) -> UplinkResult<Self> {
        let url = Url::parse(url)?;
        if url.host_str().is_none() {
            return Err(UplinkError::Config(format!("collector URL has no host: {}", url)));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(format!("aqms-node/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            url,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send one reading
    pub async fn send(&self, reading: &Reading) -> UplinkResult<()> {
        let payload = CollectorPayload::from(reading);
        debug!("Posting reading at {} to {}", reading.timestamp(), self.url);

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn handle_response(&self, response: reqwest::Response) -> UplinkResult<()> {
        let status = response.status();

        match status {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!("Collector unavailable, likely still waking up");
                Err(UplinkError::Unavailable(status.to_string()))
            }
            _ => {
                let message = response.text().await.unwrap_or_default();
                error!("Collector rejected reading with {}: {}", status, message);
                Err(UplinkError::server(status.as_u16(), message))
            }
        }
    }

    /// TCP reachability of the collector host
    pub async fn check_reachable(&self) -> UplinkResult<()> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| UplinkError::Config("collector URL has no host".to_string()))?;
        let port = self
            .url
            .port_or_known_default()
            .ok_or_else(|| UplinkError::Config("collector URL has no port".to_string()))?;

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(UplinkError::Io(e)),
            Err(_) => Err(UplinkError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for CollectorClient {
    async fn is_connected(&self) -> bool {
        match self.check_reachable().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Collector unreachable: {}", e);
                false
            }
        }
    }

    async fn publish(&self, reading: &Reading) -> TelemetryResult<()> {
        self.send(reading).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqms_core::{HealthSnapshot, Particulates, SensorSample, TelemetryError, Timestamp};
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reading(timestamp: Timestamp) -> Reading {
        let sample = SensorSample {
            temperature_c: Some(23.5),
            humidity_pct: None,
            particulates: Some(Particulates {
                pm1_0: 4,
                pm2_5: 7,
                pm10: 11,
            }),
            v_in: 5.1,
            v_battery: 3.75,
        };
        let status = HealthSnapshot::new()
            .with(Component::TempHumidity, false)
            .with(Component::Network, true)
            .with(Component::Collector, true);
        Reading::new(&sample, timestamp, status)
    }

    fn client(server: &MockServer) -> CollectorClient {
        CollectorClient::new(
            &format!("{}/api/data", server.uri()),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_payload_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 10, 6, 13, 20).unwrap();
        let json = serde_json::to_value(CollectorPayload::from(&reading(Timestamp::WallClock(ts)))).unwrap();

        assert_eq!(json["ts"], 1718000000);
        assert_eq!(json["temp"], 23.5);
        assert!(json["hum"].is_null());
        assert_eq!(json["pm25"], 7);
        assert_eq!(json["aht20"], false);
        assert_eq!(json["wifi"], true);
        assert!(json.get("collector").is_none());
    }

    #[test]
    fn test_uptime_reading_has_no_ts() {
        let json = serde_json::to_value(CollectorPayload::from(&reading(Timestamp::Uptime(90)))).unwrap();
        assert!(json.get("ts").is_none());
    }

    #[test]
    fn test_rejects_url_without_host() {
        let result = CollectorClient::new("unix:/tmp/sock", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(UplinkError::Config(_))));
    }

    #[tokio::test]
    async fn test_created_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/data"))
            .and(body_partial_json(serde_json::json!({
                "temp": 23.5,
                "hum": null,
                "pm1": 4,
                "pm25": 7,
                "pm10": 11,
                "battery": 3.75,
                "aht20": false,
                "wifi": true
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).publish(&reading(Timestamp::Uptime(1))).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_503_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .publish(&reading(Timestamp::Uptime(1)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_other_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad reading"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send(&reading(Timestamp::Uptime(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, UplinkError::Server { status: 422, ref message } if message == "bad reading"));
        assert!(!TelemetryError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_is_connected() {
        let server = MockServer::start().await;
        assert!(client(&server).is_connected().await);

        let closed = CollectorClient::new(
            "http://127.0.0.1:1/api/data",
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(!closed.is_connected().await);
    }
}
