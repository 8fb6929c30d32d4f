//! Utility functions for the blelt2mqtt crate.

/// Strip a display name down to characters safe for MQTT topics and ids.
///
/// Only ASCII letters, digits and `_` survive.
///
/// # Example
///
/// ```
/// use blelt2mqtt::sanitize_name;
///
/// assert_eq!(sanitize_name("LT Bureau (14)"), "LTBureau14");
/// ```
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Format bytes as lowercase hex pairs separated by `", "`, the layout used
/// in frame diagnostics.
///
/// # Example
///
/// ```
/// use blelt2mqtt::hex_dump;
///
/// assert_eq!(hex_dump(&[0xAA, 0x01]), "aa, 01");
/// ```
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(", ")
}
