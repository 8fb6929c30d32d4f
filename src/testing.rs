//! Scripted test doubles for the BLE transport and the publisher.
//!
//! Both fakes append to a shared [`Timeline`], so tests can assert on the
//! interleaving of BLE calls and publisher calls, and on when they
//! happened under Tokio's paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::{BleLink, BleTransport, DeviceAddress, Discovered, NotificationSink};
use crate::data::Reading;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::publisher::{Diagnostic, DiagnosticCategory, Publisher};
use crate::signal::Signal;

/// One observed call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Scan,
    Connect,
    Release,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Discovery(String),
    Retract(String),
    Reading(Reading),
    Diagnostic(DiagnosticCategory),
}

/// Ordered, timestamped call log.
#[derive(Debug, Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<(Instant, Call)>>>);

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: Call) {
        self.0.lock().push((Instant::now(), call));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.0.lock().iter().filter(|(_, c)| c == call).count()
    }

    pub fn times_of(&self, call: &Call) -> Vec<Instant> {
        self.0
            .lock()
            .iter()
            .filter(|(_, c)| c == call)
            .map(|(at, _)| *at)
            .collect()
    }

    /// Position of the first occurrence of `call`.
    pub fn position(&self, call: &Call) -> Option<usize> {
        self.0.lock().iter().position(|(_, c)| c == call)
    }
}

/// Result of one scripted scan.
pub enum ScanScript {
    /// Device seen, optionally advertising a name.
    Found(Option<String>),
    NotFound,
    Fail(Error),
}

/// Behaviour of a link once connected.
#[derive(Debug, Clone, Default)]
pub struct LinkScript {
    /// Frames delivered right after subscribing.
    pub frames: Vec<Vec<u8>>,
    /// Fire the disconnect signal right after subscribing.
    pub drop_after_subscribe: bool,
    /// Fail the subscribe call with a structural error.
    pub fail_subscribe: bool,
    /// Never complete the subscribe call.
    pub hang_subscribe: bool,
}

/// Result of one scripted connect.
pub enum ConnectScript {
    Link(LinkScript),
    Fail(Error),
    /// Never complete.
    Hang,
}

/// Transport replaying scripted scan and connect results.
///
/// Once the scan script is exhausted, further scans never complete.
/// Once the connect script is exhausted, connects succeed with a quiet link.
pub struct FakeTransport {
    timeline: Timeline,
    scans: Mutex<VecDeque<ScanScript>>,
    connects: Mutex<VecDeque<ConnectScript>>,
}

impl FakeTransport {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            timeline,
            scans: Mutex::new(VecDeque::new()),
            connects: Mutex::new(VecDeque::new()),
        }
    }

    pub fn scan(self, script: ScanScript) -> Self {
        self.scans.lock().push_back(script);
        self
    }

    pub fn connect(self, script: ConnectScript) -> Self {
        self.connects.lock().push_back(script);
        self
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    type Device = DeviceAddress;
    type Link = FakeLink;

    async fn scan_by_address(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Discovered<DeviceAddress>>> {
        self.timeline.push(Call::Scan);
        let next = self.scans.lock().pop_front();
        match next {
            Some(ScanScript::Found(local_name)) => Ok(Some(Discovered {
                device: *address,
                local_name,
                rssi: Some(-60),
            })),
            Some(ScanScript::NotFound) => Ok(None),
            Some(ScanScript::Fail(e)) => Err(e),
            None => std::future::pending().await,
        }
    }

    async fn connect(&self, _device: &DeviceAddress, on_disconnect: Signal) -> Result<FakeLink> {
        self.timeline.push(Call::Connect);
        let next = self.connects.lock().pop_front();
        match next.unwrap_or(ConnectScript::Link(LinkScript::default())) {
            ConnectScript::Link(script) => Ok(FakeLink {
                timeline: self.timeline.clone(),
                script,
                on_disconnect,
                sink: Mutex::new(None),
            }),
            ConnectScript::Fail(e) => Err(e),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn release(&self, _device: &DeviceAddress) -> Result<()> {
        self.timeline.push(Call::Release);
        Ok(())
    }
}

/// Link produced by [`FakeTransport`].
pub struct FakeLink {
    timeline: Timeline,
    script: LinkScript,
    on_disconnect: Signal,
    sink: Mutex<Option<NotificationSink>>,
}

#[async_trait]
impl BleLink for FakeLink {
    async fn subscribe(&self, characteristic: Uuid, sink: NotificationSink) -> Result<()> {
        self.timeline.push(Call::Subscribe);
        if self.script.hang_subscribe {
            return std::future::pending().await;
        }
        if self.script.fail_subscribe {
            return Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            });
        }
        for frame in &self.script.frames {
            let _ = sink.send(frame.clone());
        }
        *self.sink.lock() = Some(sink);
        if self.script.drop_after_subscribe {
            self.on_disconnect.fire();
        }
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
        self.timeline.push(Call::Unsubscribe);
        self.sink.lock().take();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.timeline.push(Call::Disconnect);
        self.sink.lock().take();
        self.on_disconnect.fire();
        Ok(())
    }
}

/// Publisher appending every call to a [`Timeline`].
pub struct RecordingPublisher {
    timeline: Timeline,
}

impl RecordingPublisher {
    pub fn new(timeline: Timeline) -> Self {
        Self { timeline }
    }
}

impl Publisher for RecordingPublisher {
    fn publish_discovery(&self, device: &DeviceIdentity) {
        self.timeline.push(Call::Discovery(device.name.clone()));
    }

    fn retract_discovery(&self, device: &DeviceIdentity) {
        self.timeline.push(Call::Retract(device.name.clone()));
    }

    fn publish_reading(&self, _device: &DeviceIdentity, reading: &Reading) {
        self.timeline.push(Call::Reading(*reading));
    }

    fn publish_diagnostic(&self, _device: &DeviceIdentity, diagnostic: &Diagnostic) {
        self.timeline.push(Call::Diagnostic(diagnostic.category));
    }
}

/// Error reported by BlueZ when another scan or connect is running.
pub fn busy() -> Error {
    Error::AdapterBusy {
        reason: "org.bluez.Error.InProgress".to_string(),
    }
}

/// Unclassified failure from the BLE stack.
pub fn stack_failure(message: &str) -> Error {
    Error::Bluetooth(btleplug::Error::Other(message.to_string().into()))
}
