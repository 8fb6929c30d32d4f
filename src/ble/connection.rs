//! BLE connection management.
//!
//! [`PeripheralLink`] is the btleplug implementation of [`BleLink`]: it
//! connects, discovers characteristics, forwards notifications and watches
//! the adapter for the disconnect event.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{BleLink, NotificationSink};
use crate::ble::uuids::is_lt_service;
use crate::error::{Error, Result};
use crate::signal::Signal;

/// An open btleplug connection to one sensor.
pub struct PeripheralLink {
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Set once connected and discovered, cleared on the first disconnect.
    open: Mutex<bool>,
    /// Cached characteristics by UUID.
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
    /// Notification forwarding tasks by characteristic.
    listeners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Task watching the adapter for this peripheral's disconnect event.
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PeripheralLink {
    /// Connect to `peripheral` and discover its characteristics.
    ///
    /// The disconnect watcher is running before the connection attempt
    /// starts, so `on_disconnect` cannot miss an early drop.
    pub async fn establish(
        adapter: &Adapter,
        peripheral: Peripheral,
        on_disconnect: Signal,
        timeout: Duration,
    ) -> Result<Self> {
        let watcher = Self::spawn_disconnect_watcher(adapter, &peripheral, on_disconnect).await?;

        let link = Self {
            peripheral,
            open: Mutex::new(false),
            characteristics: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            watcher: Mutex::new(Some(watcher)),
        };

        match tokio::time::timeout(timeout, link.connect_and_discover()).await {
            Ok(Ok(())) => {
                *link.open.lock() = true;
                Ok(link)
            }
            Ok(Err(e)) => {
                link.teardown().await;
                Err(e)
            }
            Err(_) => {
                link.teardown().await;
                Err(Error::ConnectionFailed {
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        }
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    async fn spawn_disconnect_watcher(
        adapter: &Adapter,
        peripheral: &Peripheral,
        on_disconnect: Signal,
    ) -> Result<JoinHandle<()>> {
        let mut events = adapter.events().await.map_err(Error::from_bluetooth)?;
        let id = peripheral.id();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        debug!("Device disconnected: {:?}", id);
                        on_disconnect.fire();
                        return;
                    }
                }
            }
            trace!("Adapter event stream ended");
        }))
    }

    async fn connect_and_discover(&self) -> Result<()> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.connect().await.map_err(|e| match Error::from_bluetooth(e) {
                Error::Bluetooth(e) => Error::ConnectionFailed {
                    reason: e.to_string(),
                },
                other => other,
            })?;
        }

        info!("Connected to {}", self.peripheral.address());

        self.peripheral
            .discover_services()
            .await
            .map_err(Error::from_bluetooth)?;

        let services = self.peripheral.services();
        if !services.iter().any(|s| is_lt_service(&s.uuid)) {
            warn!(
                "{} does not expose the LT Thermometer service",
                self.peripheral.address()
            );
        }

        let mut chars = self.characteristics.write();
        chars.clear();
        for service in services {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                chars.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Discovered {} characteristics", chars.len());

        Ok(())
    }

    fn characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Stop background tasks and drop the BLE connection if still up.
    async fn teardown(&self) {
        for (_, handle) in self.listeners.lock().drain() {
            handle.abort();
        }
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            if let Err(e) = self.peripheral.disconnect().await {
                error!("Failed to disconnect: {}", e);
            }
        }
        *self.open.lock() = false;
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let target = self.characteristic(&characteristic)?;

        // Open the stream first so the earliest notifications are kept.
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::from_bluetooth)?;

        self.peripheral
            .subscribe(&target)
            .await
            .map_err(Error::from_bluetooth)?;

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                if sink.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("Notification listener for {} stopped", characteristic);
        });

        if let Some(previous) = self.listeners.lock().insert(characteristic, handle) {
            previous.abort();
        }

        debug!("Subscribed to notifications from {}", characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        if let Some(handle) = self.listeners.lock().remove(&characteristic) {
            handle.abort();
        }

        if !self.is_open() {
            return Ok(());
        }

        let target = self.characteristic(&characteristic)?;
        self.peripheral
            .unsubscribe(&target)
            .await
            .map_err(Error::from_bluetooth)?;

        debug!("Unsubscribed from notifications from {}", characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !std::mem::replace(&mut *self.open.lock(), false) {
            return Ok(());
        }

        self.teardown().await;
        info!("Disconnected from {}", self.peripheral.address());
        Ok(())
    }
}

impl Drop for PeripheralLink {
    fn drop(&mut self) {
        for (_, handle) in self.listeners.lock().drain() {
            handle.abort();
        }
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}
