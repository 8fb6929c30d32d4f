//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy plumbing for locating LT
//! Thermometer sensors by address, connecting to them and receiving
//! notification frames.

pub mod address;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use address::DeviceAddress;
pub use connection::PeripheralLink;
pub use scanner::BleScanner;
pub use transport::{BleLink, BleTransport, BtleplugTransport, Discovered, NotificationSink};
pub use uuids::*;
