//! Sensor reading value object.
//!
//! A [`Reading`] is produced once per valid `0xA2` notification frame and
//! serialises to the JSON shape published on the state topic:
//! `{"temperature": 23.5, "humidity": 45.0, "battery": 8000, "unit": "Celsius"}`.

use serde::{Deserialize, Serialize};

/// Unit flag carried in the reading frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    /// Degrees Celsius (flag byte 0).
    #[default]
    Celsius,
    /// Degrees Fahrenheit (any non-zero flag byte).
    Fahrenheit,
}

impl TemperatureUnit {
    /// Create from the raw flag byte.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Celsius,
            _ => Self::Fahrenheit,
        }
    }

    /// Unit symbol for display and discovery metadata.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Celsius => "°C",
            Self::Fahrenheit => "°F",
        }
    }
}

impl std::fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Celsius => write!(f, "Celsius"),
            Self::Fahrenheit => write!(f, "Fahrenheit"),
        }
    }
}

/// How the battery/power byte of a reading frame is scaled.
///
/// Firmware revisions disagree on this. The first bridge release published
/// the raw byte; later releases multiply it by 100. `Hundredfold` is the
/// default and `Raw` restores the first behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryScale {
    /// Publish the byte unchanged.
    Raw,
    /// Publish the byte multiplied by 100.
    #[default]
    Hundredfold,
}

impl BatteryScale {
    /// Apply the scaling to a raw battery byte.
    pub fn apply(&self, raw: u8) -> u16 {
        match self {
            Self::Raw => raw as u16,
            Self::Hundredfold => raw as u16 * 100,
        }
    }
}

/// One decoded temperature/humidity reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Temperature in `unit`, 0.1° resolution.
    pub temperature: f64,
    /// Relative humidity in percent, 0.1% resolution.
    pub humidity: f64,
    /// Battery/power level after [`BatteryScale`] is applied.
    pub battery: u16,
    /// Unit of `temperature`.
    pub unit: TemperatureUnit,
}

impl Reading {
    /// Build a reading from the raw frame fields.
    ///
    /// `temperature_raw` is the signed tenths-of-degree value,
    /// `humidity_raw` the unsigned tenths-of-percent value.
    pub fn from_raw(
        temperature_raw: i16,
        humidity_raw: u16,
        battery_raw: u8,
        unit_raw: u8,
        scale: BatteryScale,
    ) -> Self {
        Self {
            temperature: temperature_raw as f64 / 10.0,
            humidity: humidity_raw as f64 / 10.0,
            battery: scale.apply(battery_raw),
            unit: TemperatureUnit::from_raw(unit_raw),
        }
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1}{} {:.1}% battery {}",
            self.temperature,
            self.unit.symbol(),
            self.humidity,
            self.battery
        )
    }
}
