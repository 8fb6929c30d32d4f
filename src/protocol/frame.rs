//! LT Thermometer notification frame decoding.
//!
//! Each BLE notification on the sensor characteristic carries exactly one
//! frame:
//!
//! ```text
//! AA AA <type> <len_hi> <len_lo> <payload: len bytes> <checksum> <trailer>
//! ```
//!
//! The checksum is the byte sum (mod 256) of everything from the first
//! header byte through the end of the payload.
//!
//! Reading frames (type `0xA2`) carry:
//! - Bytes 5-6: temperature, signed big-endian, tenths of a degree
//! - Bytes 7-8: humidity, unsigned big-endian, tenths of a percent
//! - Byte 9: battery/power level
//! - Byte 10: unit flag (0 = Celsius)

use thiserror::Error;

use crate::data::{BatteryScale, Reading};
use crate::protocol::checksum::{checksum_pair, covered_len, PAYLOAD_OFFSET};
use crate::utils::hex_dump;

/// Value of both sync bytes at the start of every frame.
pub const HEADER_BYTE: u8 = 0xAA;

/// Frames must be strictly longer than this to carry a header.
pub const MIN_HEADER_LEN: usize = 6;

/// Reading frames must be strictly longer than this.
pub const MIN_READING_LEN: usize = 10;

/// Frame type byte at offset 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Current temperature/humidity reading (0xA2).
    Reading,
    /// Hourly history record (0xA3).
    HourData,
    /// Firmware version string (0xA4).
    VersionInfo,
    /// Anything else.
    Other(u8),
}

impl FrameType {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0xA2 => Self::Reading,
            0xA3 => Self::HourData,
            0xA4 => Self::VersionInfo,
            other => Self::Other(other),
        }
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        match self {
            Self::Reading => 0xA2,
            Self::HourData => 0xA3,
            Self::VersionInfo => 0xA4,
            Self::Other(value) => *value,
        }
    }
}

/// Successful outcome of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A sensor reading.
    Reading(Reading),
    /// Hour/history data; recognised but not interpreted.
    HourData {
        /// Hex dump of the whole frame.
        hex: String,
    },
    /// Firmware version information.
    VersionInfo(String),
    /// A frame with a valid header and checksum but an unknown type.
    Unrecognized {
        /// The type byte.
        frame_type: u8,
        /// Hex dump of the whole frame.
        hex: String,
    },
}

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// Too short, or not starting with `AA AA`.
    #[error("Unknown data: {hex}")]
    UnknownHeader {
        /// Hex dump of the frame.
        hex: String,
    },

    /// Checksum byte does not match the frame content.
    #[error("Checksum error: computed {computed}, frame carries {expected}, data {hex}")]
    ChecksumMismatch {
        /// Checksum computed over the frame.
        computed: u8,
        /// Checksum byte carried by the frame.
        expected: u8,
        /// Hex dump of the frame.
        hex: String,
    },

    /// A reading-type frame too short to hold all reading fields.
    #[error("Truncated reading frame ({length} bytes): {hex}")]
    TruncatedReadingFrame {
        /// Frame length in bytes.
        length: usize,
        /// Hex dump of the frame.
        hex: String,
    },
}

/// Decode one notification frame using the default battery scaling.
///
/// # Example
///
/// ```
/// use blelt2mqtt::protocol::{decode, Decoded};
///
/// let frame = [
///     0xAA, 0xAA, 0xA2, 0x00, 0x06, // header, 6-byte payload
///     0x00, 0xEB, 0x01, 0xC2, 0x50, 0x00, // 23.5°, 45.0%, battery 80, Celsius
///     0xFA, 0x00, // checksum, trailer
/// ];
/// match decode(&frame) {
///     Ok(Decoded::Reading(reading)) => assert_eq!(reading.temperature, 23.5),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
pub fn decode(data: &[u8]) -> Result<Decoded, RejectReason> {
    decode_with(data, BatteryScale::default())
}

/// Decode one notification frame with an explicit battery scaling.
///
/// Pure: never panics on malformed input, and every failure is a
/// [`RejectReason`].
pub fn decode_with(data: &[u8], battery_scale: BatteryScale) -> Result<Decoded, RejectReason> {
    if data.len() <= MIN_HEADER_LEN || data[0] != HEADER_BYTE || data[1] != HEADER_BYTE {
        return Err(RejectReason::UnknownHeader {
            hex: hex_dump(data),
        });
    }

    // Length > 6 guarantees both the length field and the checksum byte exist.
    let (computed, expected) = checksum_pair(data).ok_or_else(|| RejectReason::UnknownHeader {
        hex: hex_dump(data),
    })?;
    if computed != expected {
        return Err(RejectReason::ChecksumMismatch {
            computed,
            expected,
            hex: hex_dump(data),
        });
    }

    match FrameType::from_raw(data[2]) {
        FrameType::Reading => {
            if data.len() <= MIN_READING_LEN {
                return Err(RejectReason::TruncatedReadingFrame {
                    length: data.len(),
                    hex: hex_dump(data),
                });
            }
            Ok(Decoded::Reading(Reading::from_raw(
                to_signed16(data[5], data[6]),
                u16::from_be_bytes([data[7], data[8]]),
                data[9],
                data[10],
                battery_scale,
            )))
        }
        FrameType::HourData => Ok(Decoded::HourData {
            hex: hex_dump(data),
        }),
        FrameType::VersionInfo => Ok(Decoded::VersionInfo(version_string(data))),
        FrameType::Other(frame_type) => Ok(Decoded::Unrecognized {
            frame_type,
            hex: hex_dump(data),
        }),
    }
}

/// Sign-extend a big-endian 16-bit value.
fn to_signed16(hi: u8, lo: u8) -> i16 {
    let raw = u16::from_be_bytes([hi, lo]) as i32;
    ((raw ^ 0x8000) - 0x8000) as i16
}

/// Payload of a version frame as printable ASCII.
fn version_string(data: &[u8]) -> String {
    let end = covered_len(data).unwrap_or(data.len());
    let payload = data.get(PAYLOAD_OFFSET..end).unwrap_or_default();
    payload
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// Build a well-formed reading frame.
#[cfg(test)]
pub(crate) fn reading_frame(temperature_raw: i16, humidity_raw: u16, battery: u8, unit: u8) -> Vec<u8> {
    let mut body = vec![HEADER_BYTE, HEADER_BYTE, 0xA2, 0x00, 0x06];
    body.extend_from_slice(&temperature_raw.to_be_bytes());
    body.extend_from_slice(&humidity_raw.to_be_bytes());
    body.push(battery);
    body.push(unit);
    crate::protocol::checksum::append_checksum(&body, 0x00)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TemperatureUnit;
    use crate::protocol::checksum::append_checksum;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn expect_reading(data: &[u8]) -> Reading {
        match decode(data) {
            Ok(Decoded::Reading(reading)) => reading,
            other => panic!("expected a reading, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_type_roundtrip() {
        for raw in [0xA2, 0xA3, 0xA4, 0x01, 0xFF] {
            assert_eq!(FrameType::from_raw(raw).to_raw(), raw);
        }
    }

    #[test]
    fn test_documented_reading_frame() {
        let frame = [
            0xAA, 0xAA, 0xA2, 0x00, 0x06, 0x00, 0xEB, 0x01, 0xC2, 0x50, 0x00, 0xFA, 0x00,
        ];
        assert_eq!(
            expect_reading(&frame),
            Reading {
                temperature: 23.5,
                humidity: 45.0,
                battery: 8000,
                unit: TemperatureUnit::Celsius,
            }
        );
    }

    #[test]
    fn test_raw_battery_scale() {
        let frame = reading_frame(235, 450, 80, 0);
        match decode_with(&frame, BatteryScale::Raw) {
            Ok(Decoded::Reading(reading)) => assert_eq!(reading.battery, 80),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negative_temperature() {
        // -550 as two's complement big-endian.
        let frame = reading_frame(-550, 300, 1, 0);
        assert_eq!(&frame[5..7], &[0xFD, 0xDA]);
        assert_eq!(expect_reading(&frame).temperature, -55.0);
    }

    #[test]
    fn test_temperature_sign_boundaries() {
        assert_eq!(to_signed16(0x00, 0x00), 0);
        assert_eq!(to_signed16(0x7F, 0xFF), i16::MAX);
        assert_eq!(to_signed16(0x80, 0x00), i16::MIN);
        assert_eq!(to_signed16(0xFF, 0xFF), -1);
    }

    #[test]
    fn test_fahrenheit_flag() {
        let frame = reading_frame(720, 500, 90, 1);
        assert_eq!(expect_reading(&frame).unit, TemperatureUnit::Fahrenheit);
    }

    #[test]
    fn test_unknown_header() {
        let frame = [0xAB, 0xAA, 0xA2, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            decode(&frame),
            Err(RejectReason::UnknownHeader {
                hex: "ab, aa, a2, 00, 00, 00, 00, 00".to_string()
            })
        );
        assert!(matches!(
            decode(&[0xAA, 0xAA, 0xA2, 0x00, 0x00, 0x00]),
            Err(RejectReason::UnknownHeader { .. })
        ));
        assert!(matches!(decode(&[]), Err(RejectReason::UnknownHeader { .. })));
    }

    #[test]
    fn test_checksum_mismatch_reports_both_values() {
        let mut frame = reading_frame(235, 450, 80, 0);
        let idx = frame.len() - 2;
        let good = frame[idx];
        frame[idx] = good.wrapping_add(3);
        match decode(&frame) {
            Err(RejectReason::ChecksumMismatch {
                computed, expected, ..
            }) => {
                assert_eq!(computed, good);
                assert_eq!(expected, good.wrapping_add(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_reading_frame() {
        // Reading type with a 3-byte payload: 10 bytes in total.
        let frame = append_checksum(&[0xAA, 0xAA, 0xA2, 0x00, 0x03, 0x00, 0xEB, 0x01], 0x00);
        assert_eq!(frame.len(), 10);
        assert!(matches!(
            decode(&frame),
            Err(RejectReason::TruncatedReadingFrame { length: 10, .. })
        ));
    }

    #[test]
    fn test_hour_data_frame() {
        let frame = append_checksum(&[0xAA, 0xAA, 0xA3, 0x00, 0x02, 0x01, 0x02], 0x00);
        match decode(&frame) {
            Ok(Decoded::HourData { hex }) => assert!(hex.starts_with("aa, aa, a3")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_version_info_frame() {
        let mut body = vec![0xAA, 0xAA, 0xA4, 0x00, 0x06];
        body.extend_from_slice(b"V1.0.3");
        let frame = append_checksum(&body, 0x00);
        assert_eq!(decode(&frame), Ok(Decoded::VersionInfo("V1.0.3".to_string())));
    }

    #[test]
    fn test_unrecognized_frame() {
        let frame = append_checksum(&[0xAA, 0xAA, 0x10, 0x00, 0x01, 0x42], 0x00);
        match decode(&frame) {
            Ok(Decoded::Unrecognized { frame_type, .. }) => assert_eq!(frame_type, 0x10),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_field_is_clamped() {
        // Declared payload runs past the buffer; the sum covers the whole buffer.
        let frame = [0xAA, 0xAA, 0xA2, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&frame),
            Err(RejectReason::ChecksumMismatch {
                computed: 0xF4,
                expected: 0x00,
                hex: hex_dump(&frame),
            })
        );
    }

    proptest! {
        #[test]
        fn prop_short_frames_are_unknown(data in proptest::collection::vec(any::<u8>(), 0..7)) {
            let is_unknown = matches!(decode(&data), Err(RejectReason::UnknownHeader { .. }));
            prop_assert!(is_unknown);
        }

        #[test]
        fn prop_bad_sync_is_unknown(
            first in any::<u8>(),
            second in any::<u8>(),
            rest in proptest::collection::vec(any::<u8>(), 5..32),
        ) {
            prop_assume!(first != HEADER_BYTE || second != HEADER_BYTE);
            let mut data = vec![first, second];
            data.extend(rest);
            let is_unknown = matches!(decode(&data), Err(RejectReason::UnknownHeader { .. }));
            prop_assert!(is_unknown);
        }

        #[test]
        fn prop_corrupt_checksum_is_rejected(
            temperature in any::<i16>(),
            humidity in any::<u16>(),
            battery in any::<u8>(),
            delta in 1u8..=255,
        ) {
            let mut frame = reading_frame(temperature, humidity, battery, 0);
            let idx = frame.len() - 2;
            frame[idx] = frame[idx].wrapping_add(delta);
            let is_mismatch = matches!(decode(&frame), Err(RejectReason::ChecksumMismatch { .. }));
            prop_assert!(is_mismatch);
        }

        #[test]
        fn prop_reading_roundtrip(
            temperature in any::<i16>(),
            humidity in any::<u16>(),
            battery in any::<u8>(),
            unit in any::<u8>(),
        ) {
            let frame = reading_frame(temperature, humidity, battery, unit);
            let first = decode(&frame);
            let second = decode(&frame);
            prop_assert_eq!(&first, &second);
            match first {
                Ok(Decoded::Reading(reading)) => {
                    prop_assert_eq!(reading.temperature, temperature as f64 / 10.0);
                    prop_assert_eq!(reading.humidity, humidity as f64 / 10.0);
                    prop_assert_eq!(reading.battery, battery as u16 * 100);
                    prop_assert_eq!(reading.unit, TemperatureUnit::from_raw(unit));
                }
                other => prop_assert!(false, "expected reading, got {:?}", other),
            }
        }
    }
}
