//! Bridge configuration.
//!
//! Settings are layered with figment, lowest priority first:
//! - built-in defaults
//! - a TOML file (`blelt2mqtt.toml` unless `--config` names another)
//! - environment variables prefixed `BLELT2MQTT_`, nested with `__`
//!   (e.g. `BLELT2MQTT_MQTT__HOST=broker.lan`)
//!
//! Unknown keys are rejected everywhere.
//!
//! ```toml
//! [mqtt]
//! host = "broker.lan"
//!
//! [[devices]]
//! mac = "C8:33:DE:43:2C:00"
//! custom_name = "LT Bureau"
//! domoticz_idx = 96
//! ```

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ble::DeviceAddress;
use crate::data::BatteryScale;
use crate::error::{Error, Result};
use crate::publisher::MqttSettings;
use crate::session::{AfterIdle, NotFoundPolicy, SessionConfig};

/// Configuration file read when none is given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "blelt2mqtt.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "BLELT2MQTT_";

/// Shortest keep-alive the MQTT client accepts.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Logging.
    pub log: LogConfig,
    /// MQTT broker and topics.
    pub mqtt: MqttSettings,
    /// Scanning and connection behaviour shared by all devices.
    pub ble: BleSettings,
    /// Sensors to bridge, in order.
    pub devices: Vec<DeviceConfig>,
}

/// `log` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Minimum level written.
    pub level: LogLevel,
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[serde(alias = "warning")]
    Warn,
    #[default]
    #[serde(alias = "notice")]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// `ble` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BleSettings {
    /// How long one scan looks for a device.
    pub scan_timeout_secs: u64,
    /// Time allowed for connecting and discovering services.
    pub connect_timeout_secs: u64,
    /// Pause after the adapter reports it is busy.
    pub busy_backoff_secs: u64,
    /// Pause after a failed connection attempt.
    pub retry_delay_secs: u64,
    /// Reaction to a device that was not seen.
    pub not_found: NotFoundPolicy,
    /// Pause before scanning again for a missing device.
    pub not_found_delay_secs: u64,
    /// Consecutive failed connection attempts tolerated; unlimited if absent.
    pub max_connect_attempts: Option<u32>,
    /// Reconnect after a disconnect instead of stopping.
    pub reconnect: bool,
    /// Behaviour once the idle wait elapses.
    pub after_idle: AfterIdle,
    /// Passive wait after subscribing, unless a device overrides it.
    pub idle_wait_secs: u64,
    /// Battery byte scaling.
    pub battery_scale: BatteryScale,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            connect_timeout_secs: 20,
            busy_backoff_secs: 5,
            retry_delay_secs: 5,
            not_found: NotFoundPolicy::Retry,
            not_found_delay_secs: 30,
            max_connect_attempts: None,
            reconnect: true,
            after_idle: AfterIdle::AwaitDisconnect,
            idle_wait_secs: 30,
            battery_scale: BatteryScale::Hundredfold,
        }
    }
}

impl BleSettings {
    /// Scan timeout as a duration.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// One entry of `devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Hardware address, `XX:XX:XX:XX:XX:XX`.
    pub mac: DeviceAddress,
    /// Overrides the advertised name.
    #[serde(default)]
    pub custom_name: Option<String>,
    /// Domoticz virtual sensor to update; positive when present.
    #[serde(default)]
    pub domoticz_idx: Option<u32>,
    /// Overrides `ble.idle_wait_secs` for this device.
    #[serde(default)]
    pub wait: Option<u64>,
}

impl DeviceConfig {
    /// Entry with only an address.
    pub fn new(mac: DeviceAddress) -> Self {
        Self {
            mac,
            custom_name: None,
            domoticz_idx: None,
            wait: None,
        }
    }
}

impl BridgeConfig {
    /// Load and validate the configuration.
    ///
    /// A missing default file is fine; a missing explicitly named file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::config(format!(
                        "configuration file {} does not exist",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        Self::from_figment(Self::figment(&file))
    }

    /// Provider stack for `file`.
    pub fn figment(file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate from an arbitrary provider stack.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::config("no devices configured"));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.mac) {
                return Err(Error::config(format!("duplicate device {}", device.mac)));
            }
            if device.domoticz_idx == Some(0) {
                return Err(Error::config(format!(
                    "device {}: domoticz_idx must be a positive integer",
                    device.mac
                )));
            }
        }

        if self.ble.scan_timeout_secs == 0 {
            return Err(Error::config("ble.scan_timeout_secs must be positive"));
        }
        if self.ble.connect_timeout_secs == 0 {
            return Err(Error::config("ble.connect_timeout_secs must be positive"));
        }
        if self.ble.max_connect_attempts == Some(0) {
            return Err(Error::config(
                "ble.max_connect_attempts must be positive; omit it for no limit",
            ));
        }

        if self.mqtt.enable {
            if self.mqtt.host.trim().is_empty() {
                return Err(Error::config("mqtt.host must not be empty"));
            }
            if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
                return Err(Error::config(format!(
                    "mqtt.keep_alive_secs must be at least {}",
                    MIN_KEEP_ALIVE_SECS
                )));
            }
            if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
                return Err(Error::config("mqtt.password requires mqtt.username"));
            }
        }

        Ok(())
    }

    /// Merge the shared `ble` settings into one [`SessionConfig`] per device.
    pub fn session_configs(&self) -> Vec<SessionConfig> {
        let ble = &self.ble;
        self.devices
            .iter()
            .map(|device| SessionConfig {
                address: device.mac,
                custom_name: device.custom_name.clone(),
                integration_id: device.domoticz_idx,
                idle_wait: Duration::from_secs(device.wait.unwrap_or(ble.idle_wait_secs)),
                busy_backoff: Duration::from_secs(ble.busy_backoff_secs),
                retry_delay: Duration::from_secs(ble.retry_delay_secs),
                not_found: ble.not_found,
                not_found_delay: Duration::from_secs(ble.not_found_delay_secs),
                max_connect_attempts: ble.max_connect_attempts,
                reconnect: ble.reconnect,
                after_idle: ble.after_idle,
                battery_scale: ble.battery_scale,
            })
            .collect()
    }
}
