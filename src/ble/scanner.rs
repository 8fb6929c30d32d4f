//! BLE scanning functionality.
//!
//! Locates sensors by hardware address. Several device sessions may scan
//! at once on the same adapter, so the adapter-level scan is reference
//! counted: the first caller starts it and the last one stops it.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::ble::address::DeviceAddress;
use crate::ble::transport::Discovered;
use crate::error::{Error, Result};

/// BLE scanner for locating sensors by address.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Number of callers currently relying on an active scan.
    active_scans: Arc<Mutex<usize>>,
    /// How long a single lookup scans before giving up.
    scan_timeout: Duration,
}

impl BleScanner {
    /// Create a new BLE scanner on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::from_bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self {
            adapter,
            active_scans: Arc::new(Mutex::new(0)),
            scan_timeout,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for the device with the given address.
    ///
    /// Only a fresh advertisement counts: the adapter keeps peripherals it
    /// saw earlier even after they go out of range, so its cache is not
    /// consulted. Scans for up to the configured timeout.
    pub async fn find_by_address(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Discovered<Peripheral>>> {
        // Subscribe before starting the scan so no discovery event is missed.
        let events = self
            .adapter
            .events()
            .await
            .map_err(Error::from_bluetooth)?;

        let _guard = self.acquire_scan().await?;
        let outcome = tokio::time::timeout(self.scan_timeout, self.wait_for(address, events)).await;

        match outcome {
            Ok(found) => found,
            Err(_) => {
                debug!(
                    "Scan for {} timed out after {:?}",
                    address, self.scan_timeout
                );
                Ok(None)
            }
        }
    }

    /// Wait for a discovery event from the wanted device.
    async fn wait_for<S>(
        &self,
        address: &DeviceAddress,
        mut events: S,
    ) -> Result<Option<Discovered<Peripheral>>>
    where
        S: futures::Stream<Item = CentralEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            if let Some(found) = self.check_peripheral(address, &id).await {
                return Ok(Some(found));
            }
        }

        debug!("Adapter event stream ended while scanning for {}", address);
        Ok(None)
    }

    /// Resolve an event id and check it against the wanted address.
    async fn check_peripheral(
        &self,
        address: &DeviceAddress,
        id: &PeripheralId,
    ) -> Option<Discovered<Peripheral>> {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        if !address.matches(&peripheral.address()) {
            return None;
        }

        Some(Self::describe(peripheral).await)
    }

    /// Attach advertisement details to a peripheral.
    async fn describe(peripheral: Peripheral) -> Discovered<Peripheral> {
        let properties = peripheral.properties().await.ok().flatten();
        Discovered {
            local_name: properties.as_ref().and_then(|p| p.local_name.clone()),
            rssi: properties.as_ref().and_then(|p| p.rssi),
            device: peripheral,
        }
    }

    /// Register a scanning caller, starting the adapter scan if needed.
    async fn acquire_scan(&self) -> Result<ScanGuard> {
        let mut active = self.active_scans.lock().await;
        if *active == 0 {
            debug!("Starting BLE scan");
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(Error::from_bluetooth)?;
        }
        *active += 1;
        Ok(ScanGuard {
            adapter: self.adapter.clone(),
            active_scans: self.active_scans.clone(),
        })
    }
}

/// Releases one scanning caller when dropped, including when the lookup is
/// cancelled mid-scan.
struct ScanGuard {
    adapter: Adapter,
    active_scans: Arc<Mutex<usize>>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let adapter = self.adapter.clone();
        let active_scans = self.active_scans.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let mut active = active_scans.lock().await;
            *active = active.saturating_sub(1);
            if *active == 0 {
                debug!("Stopping BLE scan");
                if let Err(e) = adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
            }
        });
    }
}
