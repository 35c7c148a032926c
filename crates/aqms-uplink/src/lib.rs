//! AQMS Uplink - Network side of the telemetry pipeline
//!
//! - **Collector**: JSON POST transport for the primary backend
//! - **ThingSpeak**: best-effort channel mirror
//! - **SNTP**: network time source

pub mod collector;
pub mod error;
pub mod sntp;
pub mod thingspeak;

pub use collector::CollectorClient;
pub use error::{UplinkError, UplinkResult};
pub use sntp::SntpTimeSource;
pub use thingspeak::ThingSpeakClient;
