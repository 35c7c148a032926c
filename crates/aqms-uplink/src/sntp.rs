//! SNTP client (RFC 4330 subset) used as the network time source

use crate::error::{UplinkError, UplinkResult};
use aqms_core::{NetworkTimeSource, TelemetryError, TelemetryResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Seconds between the NTP era (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const NTP_PACKET_LEN: usize = 48;

/// Highest stratum accepted from a server
const MAX_STRATUM: u8 = 15;

/// Client request: LI=0, VN=3, Mode=3
fn request_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Extract the server transmit timestamp from a response packet
pub fn decode_response(packet: &[u8]) -> UplinkResult<DateTime<Utc>> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(UplinkError::Ntp(format!("short packet: {} bytes", packet.len())));
    }

    let mode = packet[0] & 0x07;
    if mode != 4 {
        return Err(UplinkError::Ntp(format!("unexpected mode {}", mode)));
    }

    let stratum = packet[1];
    if stratum == 0 || stratum > MAX_STRATUM {
        // stratum 0 is a kiss-o'-death
        return Err(UplinkError::Ntp(format!("invalid stratum {}", stratum)));
    }

    let secs = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
    let frac = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]) as u64;
    if secs < NTP_UNIX_OFFSET {
        return Err(UplinkError::Ntp("transmit timestamp before 1970".to_string()));
    }

    let nanos = ((frac * 1_000_000_000) >> 32) as u32;
    DateTime::from_timestamp((secs - NTP_UNIX_OFFSET) as i64, nanos)
        .ok_or_else(|| UplinkError::Ntp("transmit timestamp out of range".to_string()))
}

/// Network time from an NTP server
pub struct SntpTimeSource {
    server: String,
}

impl SntpTimeSource {
    /// `server` is `host:port`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn exchange(&self) -> UplinkResult<DateTime<Utc>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.server).await?;

        let sent_at = Instant::now();
        socket.send(&request_packet()).await?;

        let mut response = [0u8; NTP_PACKET_LEN];
        let len = socket.recv(&mut response).await?;
        let rtt = sent_at.elapsed();

        let transmit = decode_response(&response[..len])?;

        // Half the round trip, capped at one second
        let correction = (rtt / 2).min(Duration::from_secs(1));
        let time = transmit + ChronoDuration::from_std(correction).unwrap_or_default();
        debug!("NTP round trip {:?} from {}", rtt, self.server);
        Ok(time)
    }

    /// Query the server, giving up after `timeout`
    pub async fn query(&self, timeout: Duration) -> UplinkResult<DateTime<Utc>> {
        match tokio::time::timeout(timeout, self.exchange()).await {
            Ok(result) => result,
            Err(_) => Err(UplinkError::Timeout),
        }
    }
}

#[async_trait]
impl NetworkTimeSource for SntpTimeSource {
    async fn fetch(&self, timeout: Duration) -> TelemetryResult<DateTime<Utc>> {
        match self.query(timeout).await {
            Ok(time) => {
                info!("SNTP time from {}: {}", self.server, time);
                Ok(time)
            }
            Err(e) => {
                warn!("SNTP query to {} failed: {}", self.server, e);
                Err(TelemetryError::TimeUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn response(stratum: u8, unix_secs: u64, frac: u32) -> [u8; NTP_PACKET_LEN] {
        let mut packet = [0u8; NTP_PACKET_LEN];
        // LI=0, VN=3, Mode=4
        packet[0] = 0x1C;
        packet[1] = stratum;
        let secs = (unix_secs + NTP_UNIX_OFFSET) as u32;
        packet[40..44].copy_from_slice(&secs.to_be_bytes());
        packet[44..48].copy_from_slice(&frac.to_be_bytes());
        packet
    }

    #[test]
    fn test_decode_transmit_timestamp() {
        let packet = response(2, 1_718_000_000, 0x8000_0000);
        let time = decode_response(&packet).unwrap();
        assert_eq!(time.timestamp(), 1_718_000_000);
        assert_eq!(time.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_decode_rejects_bad_packets() {
        assert!(decode_response(&[0u8; 12]).is_err());
        assert!(decode_response(&response(0, 1_718_000_000, 0)).is_err());
        assert!(decode_response(&response(16, 1_718_000_000, 0)).is_err());

        let mut client_mode = response(2, 1_718_000_000, 0);
        client_mode[0] = 0x1B;
        assert!(decode_response(&client_mode).is_err());
    }

    #[tokio::test]
    async fn test_query_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; NTP_PACKET_LEN];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, NTP_PACKET_LEN);
            assert_eq!(buf[0], 0x1B);
            server
                .send_to(&response(1, 1_700_000_000, 0), peer)
                .await
                .unwrap();
        });

        let source = SntpTimeSource::new(addr.to_string());
        let time = source.fetch(Duration::from_secs(2)).await.unwrap();
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(time >= expected && time < expected + ChronoDuration::seconds(2));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // bound but never answers
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = SntpTimeSource::new(server.local_addr().unwrap().to_string());

        let err = source.fetch(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::TimeUnavailable(_)));
    }
}
