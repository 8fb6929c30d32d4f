//! Checksum calculation for LT Thermometer notification frames.
//!
//! The checksum is the plain byte sum, modulo 256, of the frame header and
//! payload. It sits in the second-to-last byte of the frame; the last byte
//! is a trailer that is not covered.

/// Offset of the first payload byte (after `AA AA type len_hi len_lo`).
pub const PAYLOAD_OFFSET: usize = 5;

/// Sum of `data`, modulo 256.
///
/// # Example
///
/// ```
/// use blelt2mqtt::protocol::calculate_checksum;
///
/// assert_eq!(calculate_checksum(&[0xAA, 0xAA, 0xA2]), 0xF6);
/// ```
pub fn calculate_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Length of the checksummed region declared by a frame header.
///
/// Covers bytes `0 ..= 5 + payload_length - 1`, clamped to the buffer.
/// Returns `None` when the buffer is too short to hold the length field.
pub fn covered_len(data: &[u8]) -> Option<usize> {
    if data.len() < PAYLOAD_OFFSET {
        return None;
    }
    let payload_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    Some((PAYLOAD_OFFSET + payload_len).min(data.len()))
}

/// Compute the checksum a frame should carry, and the one it does carry.
///
/// Returns `(computed, expected)`, or `None` if the frame is too short to
/// contain a length field and checksum byte.
pub fn checksum_pair(data: &[u8]) -> Option<(u8, u8)> {
    let covered = covered_len(data)?;
    if data.len() < 2 {
        return None;
    }
    Some((calculate_checksum(&data[..covered]), data[data.len() - 2]))
}

/// Verify that a frame's checksum byte matches its content.
pub fn verify_checksum(data: &[u8]) -> bool {
    checksum_pair(data)
        .map(|(computed, expected)| computed == expected)
        .unwrap_or(false)
}

/// Build a frame from header + payload, appending the checksum and a trailer byte.
///
/// `body` must start with the five header bytes; the payload length field is
/// taken as-is.
pub fn append_checksum(body: &[u8], trailer: u8) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.push(calculate_checksum(body));
    frame.push(trailer);
    frame
}
