//! Device identity as seen by publishers.
//!
//! A [`DeviceIdentity`] is built once per connection attempt, after the
//! device has been located, and travels with every publisher call for that
//! attempt.

use crate::ble::DeviceAddress;
use crate::utils::sanitize_name;

/// Pick the display name for a device.
///
/// Priority: configured override, then the name learned from the
/// advertisement, then the hardware address. Blank names count as absent.
///
/// # Example
///
/// ```
/// use blelt2mqtt::{resolve_name, DeviceAddress};
///
/// let address: DeviceAddress = "C8:33:DE:43:2C:00".parse().unwrap();
/// assert_eq!(resolve_name(None, Some("LT-01"), &address), "LT-01");
/// assert_eq!(resolve_name(Some("Office"), Some("LT-01"), &address), "Office");
/// assert_eq!(resolve_name(None, None, &address), "C8:33:DE:43:2C:00");
/// ```
pub fn resolve_name(
    custom_name: Option<&str>,
    advertised_name: Option<&str>,
    address: &DeviceAddress,
) -> String {
    fn present(name: Option<&str>) -> Option<&str> {
        name.map(str::trim).filter(|n| !n.is_empty())
    }

    present(custom_name)
        .or_else(|| present(advertised_name))
        .map(str::to_string)
        .unwrap_or_else(|| address.to_string())
}

/// Who a reading or lifecycle event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Hardware address.
    pub address: DeviceAddress,
    /// Resolved display name.
    pub name: String,
    /// `name` restricted to `[A-Za-z0-9_]`, for topics and ids.
    pub safe_name: String,
    /// Downstream integration id (Domoticz idx), when configured.
    pub integration_id: Option<u32>,
}

impl DeviceIdentity {
    /// Build an identity from a resolved name.
    pub fn new(address: DeviceAddress, name: String, integration_id: Option<u32>) -> Self {
        let mut safe_name = sanitize_name(&name);
        if safe_name.is_empty() {
            safe_name = address.compact();
        }
        Self {
            address,
            name,
            safe_name,
            integration_id,
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
