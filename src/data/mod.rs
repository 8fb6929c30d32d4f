//! Data structures for sensor data.
//!
//! Holds the reading value object emitted by the frame decoder.

pub mod reading;

pub use reading::{BatteryScale, Reading, TemperatureUnit};
