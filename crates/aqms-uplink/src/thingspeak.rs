//! ThingSpeak channel mirror
//!
//! Best-effort copy of each current reading to a ThingSpeak channel via the
//! `update` GET endpoint. Fields 1-7 are temperature, humidity, PM1.0,
//! PM2.5, PM10, input voltage and battery voltage.

use crate::error::{UplinkError, UplinkResult};
use aqms_core::{Reading, TelemetryResult, Transport};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// ThingSpeak mirror transport
pub struct ThingSpeakClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl ThingSpeakClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, timeout: Duration) -> UplinkResult<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(UplinkError::Config("ThingSpeak api_key is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("aqms-node/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        // `join` replaces the last path segment unless the base ends in '/'
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn update_url(&self, reading: &Reading) -> UplinkResult<Url> {
        let mut url = self.base_url.join("update")?;
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("field1", &format!("{:.2}", reading.temperature_c()))
            .append_pair("field2", &format!("{:.2}", reading.humidity_pct()))
            .append_pair("field3", &reading.pm1_0().to_string())
            .append_pair("field4", &reading.pm2_5().to_string())
            .append_pair("field5", &reading.pm10().to_string())
            .append_pair("field6", &format!("{:.2}", reading.v_in()))
            .append_pair("field7", &format!("{:.2}", reading.v_battery()));
        Ok(url)
    }

    pub async fn send(&self, reading: &Reading) -> UplinkResult<()> {
        let url = self.update_url(reading)?;
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => {
                debug!("Reading mirrored to ThingSpeak");
                Ok(())
            }
            status => Err(UplinkError::server(status.as_u16(), "ThingSpeak update rejected")),
        }
    }
}

#[async_trait]
impl Transport for ThingSpeakClient {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn publish(&self, reading: &Reading) -> TelemetryResult<()> {
        self.send(reading).await.map_err(Into::into)
    }
}
