// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # blelt2mqtt
//!
//! Bridges "LT Thermometer" Bluetooth Low Energy temperature/humidity
//! sensors to an MQTT broker, with Home Assistant device discovery and
//! optional Domoticz updates.
//!
//! Sensors are addressed by their fixed hardware address only.
//!
//! ## Features
//!
//! - **Frame Decoding**: Pure decoder for the sensor's notification frames
//! - **Connection Lifecycle**: Scan, connect, subscribe, recover from disconnects
//! - **Multi-device Support**: One independent session per configured sensor
//! - **MQTT Publishing**: State topics, discovery documents, Domoticz commands
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blelt2mqtt::{BtleplugTransport, LogPublisher, Result, SessionConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = BtleplugTransport::new(Duration::from_secs(10)).await?;
//!     let sensor = SessionConfig::new("C8:33:DE:43:2C:00".parse()?);
//!
//!     let supervisor = Supervisor::new(
//!         Arc::new(transport),
//!         Arc::new(LogPublisher::new()),
//!         vec![sensor],
//!     )?;
//!
//!     for report in supervisor.run().await {
//!         println!("{}: {}", report.name, report.outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Decoding works without any hardware:
//!
//! ```rust
//! use blelt2mqtt::{decode, Decoded};
//!
//! let frame = [
//!     0xAA, 0xAA, 0xA2, 0x00, 0x06, 0x00, 0xEB, 0x01, 0xC2, 0x50, 0x00, 0xFA, 0x00,
//! ];
//! if let Ok(Decoded::Reading(reading)) = decode(&frame) {
//!     assert_eq!(reading.temperature, 23.5);
//!     assert_eq!(reading.humidity, 45.0);
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. BlueZ
//! rejects overlapping scans and connects with `org.bluez.Error.InProgress`;
//! sessions back off and retry when that happens.
//!
//! ### macOS
//! Requires Bluetooth permission. macOS hides hardware addresses from
//! applications, so address-based lookup only works on Linux and Windows.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod cli;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod protocol;
pub mod publisher;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use ble::{BleLink, BleTransport, BtleplugTransport, DeviceAddress, Discovered};
pub use config::{BridgeConfig, DeviceConfig};
pub use data::{BatteryScale, Reading, TemperatureUnit};
pub use device::{resolve_name, DeviceIdentity};
pub use error::{Error, Result};
pub use protocol::{decode, decode_with, Decoded, RejectReason};
pub use publisher::{Diagnostic, DiagnosticCategory, LogPublisher, MqttPublisher, Publisher};
pub use session::{
    AfterIdle, DeviceSession, NotFoundPolicy, SessionConfig, SessionOutcome, SessionReport,
    SessionState, SessionStateChange,
};
pub use signal::Signal;
pub use supervisor::{Supervisor, DEFAULT_SHUTDOWN_GRACE};
pub use utils::{hex_dump, sanitize_name};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<Reading>();
        let _ = std::any::TypeId::of::<DeviceIdentity>();
        let _ = std::any::TypeId::of::<SessionConfig>();
        let _ = std::any::TypeId::of::<Supervisor<BtleplugTransport>>();
        let _ = std::any::TypeId::of::<DeviceSession<BtleplugTransport>>();
        let _ = std::any::TypeId::of::<MqttPublisher>();
    }

    #[test]
    fn test_decode_through_reexport() {
        let frame = [
            0xAA, 0xAA, 0xA2, 0x00, 0x06, 0x00, 0xEB, 0x01, 0xC2, 0x50, 0x00, 0xFA, 0x00,
        ];
        assert!(matches!(decode(&frame), Ok(Decoded::Reading(_))));
    }
}
