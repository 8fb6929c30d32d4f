//! Hardware address of a configured sensor.

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A validated 48-bit BLE hardware address (`C8:33:DE:43:2C:00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create from raw octets.
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets, most significant first.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Address without separators, e.g. `C833DE432C00`.
    pub fn compact(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Convert to the btleplug address type.
    pub fn to_bdaddr(&self) -> BDAddr {
        BDAddr::from(self.0)
    }

    /// Whether a btleplug address refers to this device.
    pub fn matches(&self, addr: &BDAddr) -> bool {
        addr.into_inner() == self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress {
            value: s.to_string(),
        };

        let groups: Vec<&str> = s.trim().split(':').collect();
        if groups.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, group) in octets.iter_mut().zip(&groups) {
            if group.len() != 2 {
                return Err(invalid());
            }
            hex::decode_to_slice(group, std::slice::from_mut(octet)).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: DeviceAddress = "c8:33:de:43:2c:00".parse().unwrap();
        assert_eq!(addr.octets(), [0xC8, 0x33, 0xDE, 0x43, 0x2C, 0x00]);
        assert_eq!(addr.to_string(), "C8:33:DE:43:2C:00");
        assert_eq!(addr.compact(), "C833DE432C00");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "C8:33:DE:43:2C",
            "C8:33:DE:43:2C:00:11",
            "C8-33-DE-43-2C-00",
            "C8:33:DE:43:2C:0",
            "C8:33:DE:43:2C:GG",
            "C8:33:DE:43:2C:+1",
            "+8:33:DE:43:2C:01",
            "C8:33:DE:43:2C: 1",
        ] {
            assert!(bad.parse::<DeviceAddress>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_bdaddr_conversion() {
        let addr: DeviceAddress = "C8:33:DE:43:2C:01".parse().unwrap();
        assert!(addr.matches(&addr.to_bdaddr()));
        assert!(!addr.matches(&BDAddr::from([0; 6])));
    }

    #[test]
    fn test_serde_as_string() {
        let addr: DeviceAddress = serde_json::from_str("\"C8:33:DE:43:2C:00\"").unwrap();
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"C8:33:DE:43:2C:00\"");
        assert!(serde_json::from_str::<DeviceAddress>("\"nope\"").is_err());
    }
}
