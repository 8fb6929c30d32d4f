//! Publishing readings and lifecycle events.
//!
//! Device sessions hand everything they learn to a [`Publisher`]. Every
//! call is fire-and-forget: implementations must not block on network
//! round trips and must swallow (and log) their own failures.

pub mod mqtt;

use tracing::{debug, info};

use crate::data::Reading;
use crate::device::DeviceIdentity;

pub use mqtt::{MqttPublisher, MqttSettings};

/// Kind of a non-reading event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticCategory {
    /// Hour/history frame.
    HourData,
    /// Firmware version frame.
    VersionInfo,
    /// Valid frame of an unknown type.
    Unrecognized,
    /// Frame dropped by the decoder.
    Rejected,
}

impl DiagnosticCategory {
    /// Short lowercase name used in payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HourData => "hour_data",
            Self::VersionInfo => "version_info",
            Self::Unrecognized => "unrecognized",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-reading event worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// What kind of event this is.
    pub category: DiagnosticCategory,
    /// Human-readable detail (hex dump, version string, rejection reason).
    pub detail: String,
}

impl Diagnostic {
    /// Create a diagnostic.
    pub fn new(category: DiagnosticCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

/// Receiver of everything a device session produces.
#[cfg_attr(test, mockall::automock)]
pub trait Publisher: Send + Sync {
    /// Announce a device; called each time a session becomes subscribed.
    fn publish_discovery(&self, device: &DeviceIdentity);

    /// Withdraw a device announcement; called once per subscribed connection
    /// when it is torn down.
    fn retract_discovery(&self, device: &DeviceIdentity);

    /// Publish one decoded reading.
    fn publish_reading(&self, device: &DeviceIdentity, reading: &Reading);

    /// Report a non-reading frame or a rejected frame.
    fn publish_diagnostic(&self, device: &DeviceIdentity, diagnostic: &Diagnostic);
}

/// Publisher that only writes to the log. Used when MQTT is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl LogPublisher {
    /// Create a log-only publisher.
    pub fn new() -> Self {
        Self
    }
}

impl Publisher for LogPublisher {
    fn publish_discovery(&self, device: &DeviceIdentity) {
        info!("[{}] Device {} available", device.name, device.address);
    }

    fn retract_discovery(&self, device: &DeviceIdentity) {
        info!("[{}] Device {} gone", device.name, device.address);
    }

    fn publish_reading(&self, device: &DeviceIdentity, reading: &Reading) {
        info!("[{}] {}", device.name, reading);
    }

    fn publish_diagnostic(&self, device: &DeviceIdentity, diagnostic: &Diagnostic) {
        debug!(
            "[{}] {}: {}",
            device.name, diagnostic.category, diagnostic.detail
        );
    }
}
