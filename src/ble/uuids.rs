//! BLE Service and Characteristic UUIDs.
//!
//! LT Thermometer v3 and v4 firmware expose one vendor service with a
//! notify characteristic carrying all protocol frames.

use uuid::Uuid;

/// LT Thermometer vendor service UUID.
pub const LT_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe5_0000_1000_8000_00805f9b34fb);

/// Notify characteristic carrying protocol frames.
pub const LT_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_ffe8_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is the LT Thermometer service.
pub fn is_lt_service(uuid: &Uuid) -> bool {
    *uuid == LT_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            LT_NOTIFY_UUID.to_string(),
            "0000ffe8-0000-1000-8000-00805f9b34fb"
        );
        assert!(LT_SERVICE_UUID.to_string().starts_with("0000ffe5"));
    }

    #[test]
    fn test_is_lt_service() {
        assert!(is_lt_service(&LT_SERVICE_UUID));
        assert!(!is_lt_service(&LT_NOTIFY_UUID));
    }
}
