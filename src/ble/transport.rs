//! BLE transport abstraction.
//!
//! [`BleTransport`] locates a device by hardware address and opens a
//! [`BleLink`] to it. Device sessions only talk to these traits, so the
//! state machine runs the same against btleplug and against test doubles.

use async_trait::async_trait;
use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::connection::PeripheralLink;
use crate::ble::scanner::BleScanner;
use crate::error::{Error, Result};
use crate::signal::Signal;

/// Sink receiving raw notification payloads in delivery order.
pub type NotificationSink = mpsc::UnboundedSender<Vec<u8>>;

/// A device located by a scan.
#[derive(Debug, Clone)]
pub struct Discovered<D> {
    /// Transport-specific device handle.
    pub device: D,
    /// Name from the advertisement, if any.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// Scanning and connecting.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Handle to a located, not yet connected device.
    type Device: Send + Sync + 'static;
    /// An open connection.
    type Link: BleLink + 'static;

    /// Look for the device with the given hardware address.
    ///
    /// `Ok(None)` means the scan completed without seeing it.
    async fn scan_by_address(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Discovered<Self::Device>>>;

    /// Connect to a located device.
    ///
    /// `on_disconnect` is registered before the connection is attempted and
    /// fires when the link drops for any reason.
    async fn connect(&self, device: &Self::Device, on_disconnect: Signal) -> Result<Self::Link>;

    /// Drop whatever connection an abandoned [`BleTransport::connect`] left
    /// behind for `device`.
    async fn release(&self, device: &Self::Device) -> Result<()>;
}

/// An open connection to one device.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Enable notifications on a characteristic, forwarding payloads to `sink`.
    async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Close the connection. Safe to call repeatedly.
    async fn disconnect(&self) -> Result<()>;
}

/// btleplug-backed transport using the first system adapter.
pub struct BtleplugTransport {
    scanner: BleScanner,
    connect_timeout: Duration,
}

impl BtleplugTransport {
    /// Default time allowed for connection establishment and service discovery.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::BluetoothUnavailable`] if there is no usable adapter.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::new(scan_timeout).await?,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set the connection establishment timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Device = Peripheral;
    type Link = PeripheralLink;

    async fn scan_by_address(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Discovered<Peripheral>>> {
        self.scanner.find_by_address(address).await
    }

    async fn connect(&self, device: &Peripheral, on_disconnect: Signal) -> Result<PeripheralLink> {
        PeripheralLink::establish(
            self.scanner.adapter(),
            device.clone(),
            on_disconnect,
            self.connect_timeout,
        )
        .await
    }

    async fn release(&self, device: &Peripheral) -> Result<()> {
        // BlueZ completes a pending connect even after the caller has gone;
        // Disconnect also cancels one still in flight.
        device.disconnect().await.map_err(Error::from_bluetooth)
    }
}
