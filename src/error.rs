//! Error types for the blelt2mqtt crate.

use thiserror::Error;

/// BlueZ reports an operation already running on the adapter with this name.
const BLUEZ_IN_PROGRESS: &str = "org.bluez.Error.InProgress";

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The adapter is busy with another operation (scan or connect in progress).
    #[error("Bluetooth adapter busy: {reason}")]
    AdapterBusy {
        /// Message reported by the stack.
        reason: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The BLE stack handed back something unusable; retrying will not help.
    #[error("Structural failure: {reason}")]
    Structural {
        /// Description of the failure.
        reason: String,
    },

    /// A hardware address that is not six colon-separated hex octets.
    #[error("Invalid device address: {value:?}")]
    InvalidAddress {
        /// The rejected input.
        value: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },
}

impl Error {
    /// Wrap a btleplug error, sorting it into busy, structural and transient.
    pub fn from_bluetooth(err: btleplug::Error) -> Self {
        use btleplug::Error as Ble;

        let text = err.to_string();
        if text.contains(BLUEZ_IN_PROGRESS) || text.contains("In Progress") {
            return Self::AdapterBusy { reason: text };
        }
        match err {
            Ble::PermissionDenied => Self::BluetoothUnavailable,
            Ble::NotConnected => Self::NotConnected,
            Ble::UnexpectedCallback
            | Ble::UnexpectedCharacteristic
            | Ble::NoSuchCharacteristic
            | Ble::NotSupported(_)
            | Ble::Uuid(_)
            | Ble::InvalidBDAddr(_) => Self::Structural { reason: text },
            other => Self::Bluetooth(other),
        }
    }

    /// Whether this is an unclassified failure reported by the BLE stack.
    ///
    /// The same one recurring back to back means the stack is wedged.
    pub fn is_stack_failure(&self) -> bool {
        matches!(self, Self::Bluetooth(_))
    }

    /// Whether the error is a transient adapter-busy condition worth a fixed backoff.
    pub fn is_adapter_busy(&self) -> bool {
        matches!(self, Self::AdapterBusy { .. })
    }

    /// Whether the error means the device session cannot make progress at all.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Structural { .. }
                | Self::InvalidAddress { .. }
                | Self::CharacteristicNotFound { .. }
                | Self::BluetoothUnavailable
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_maps_to_busy() {
        let err = Error::from_bluetooth(btleplug::Error::Other(
            "org.bluez.Error.InProgress: Operation already in progress".into(),
        ));
        assert!(err.is_adapter_busy());
        assert!(!err.is_structural());
    }

    #[test]
    fn test_transient_bluetooth_errors_pass_through() {
        for raw in [
            btleplug::Error::DeviceNotFound,
            btleplug::Error::TimedOut(std::time::Duration::from_secs(1)),
            btleplug::Error::Other("le-connection-abort-by-local".into()),
        ] {
            let err = Error::from_bluetooth(raw);
            assert!(matches!(err, Error::Bluetooth(_)), "{:?}", err);
            assert!(err.is_stack_failure());
            assert!(!err.is_adapter_busy());
            assert!(!err.is_structural());
        }
    }

    #[test]
    fn test_malformed_stack_results_are_structural() {
        for raw in [
            btleplug::Error::UnexpectedCallback,
            btleplug::Error::NoSuchCharacteristic,
            btleplug::Error::NotSupported("notify".into()),
            btleplug::Error::InvalidBDAddr(
                "zz".parse::<btleplug::api::BDAddr>().unwrap_err(),
            ),
        ] {
            let err = Error::from_bluetooth(raw);
            assert!(matches!(err, Error::Structural { .. }), "{:?}", err);
            assert!(err.is_structural());
            assert!(!err.is_stack_failure());
        }
    }

    #[test]
    fn test_not_connected_and_permission_mapping() {
        assert!(matches!(
            Error::from_bluetooth(btleplug::Error::NotConnected),
            Error::NotConnected
        ));
        assert!(Error::from_bluetooth(btleplug::Error::PermissionDenied).is_structural());
    }

    #[test]
    fn test_structural_classification() {
        assert!(Error::Structural {
            reason: "assertion".into()
        }
        .is_structural());
        assert!(Error::CharacteristicNotFound {
            uuid: "ffe8".into()
        }
        .is_structural());
        assert!(!Error::ConnectionFailed {
            reason: "timeout".into()
        }
        .is_structural());
    }
}
