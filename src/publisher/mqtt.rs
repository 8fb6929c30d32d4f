//! MQTT publisher.
//!
//! Topic layout, with the default prefixes:
//!
//! | Message    | Topic                                           | Payload |
//! |------------|-------------------------------------------------|---------|
//! | state      | `lt_temp/{safe_name}/state`                     | reading JSON |
//! | discovery  | `homeassistant/device/{safe_name}/config`       | device discovery document |
//! | retraction | `homeassistant/device/{safe_name}/config`       | empty |
//! | Domoticz   | `domoticz/in`                                   | `udevice` command |
//! | diagnostic | `lt_temp/{safe_name}/diagnostic`                | category + detail JSON |
//!
//! Every message is published retained with QoS 1.

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::data::Reading;
use crate::device::DeviceIdentity;
use crate::publisher::{Diagnostic, Publisher};

/// Topic Domoticz listens on for device updates.
pub const DOMOTICZ_TOPIC: &str = "domoticz/in";

/// Published in the `origin` block of discovery documents.
pub const ORIGIN_NAME: &str = "blelt2mqtt";

/// Project page advertised in discovery documents.
pub const SUPPORT_URL: &str = "https://github.com/rpeyron/blelt2mqtt";

/// Requests buffered between publishers and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Pause after a connection error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// `mqtt` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    /// Publish to a broker at all. When false readings are only logged.
    pub enable: bool,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional user name.
    pub username: Option<String>,
    /// Optional password, used together with `username`.
    pub password: Option<String>,
    /// MQTT client id.
    pub client_id: String,
    /// Prefix of state and diagnostic topics, with trailing `/`.
    pub prefix: String,
    /// Send discovery documents.
    pub discovery: bool,
    /// Prefix of discovery topics, with trailing `/`.
    pub discovery_prefix: String,
    /// Also publish diagnostics, not only log them.
    pub publish_diagnostics: bool,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "blelt2mqtt".to_string(),
            prefix: "lt_temp/".to_string(),
            discovery: true,
            discovery_prefix: "homeassistant/".to_string(),
            publish_diagnostics: false,
            keep_alive_secs: 30,
        }
    }
}

impl MqttSettings {
    /// Topic carrying readings.
    pub fn state_topic(&self, device: &DeviceIdentity) -> String {
        format!("{}{}/state", self.prefix, device.safe_name)
    }

    /// Topic carrying the discovery document.
    pub fn discovery_topic(&self, device: &DeviceIdentity) -> String {
        format!("{}device/{}/config", self.discovery_prefix, device.safe_name)
    }

    /// Topic carrying diagnostics.
    pub fn diagnostic_topic(&self, device: &DeviceIdentity) -> String {
        format!("{}{}/diagnostic", self.prefix, device.safe_name)
    }

    /// Broker-wide id of a device: the prefix without its trailing `/`
    /// followed by the bare address hex.
    pub fn unique_id(&self, device: &DeviceIdentity) -> String {
        let prefix = self.prefix.strip_suffix('/').unwrap_or(&self.prefix);
        format!("{}{}", prefix, device.address.compact())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Device discovery document for one sensor.
pub fn discovery_payload(settings: &MqttSettings, device: &DeviceIdentity) -> Value {
    let safe = &device.safe_name;
    let lower = safe.to_lowercase();
    let sensor = |class: &str, unit: &str, field: &str, suffix: &str| {
        json!({
            "platform": "sensor",
            "device_class": class,
            "unit_of_measurement": unit,
            "value_template": format!("{{{{ value_json.{}}}}}", field),
            "unique_id": format!("{}_{}", safe, suffix),
        })
    };

    json!({
        "device": {
            "ids": safe,
            "name": device.name,
        },
        "origin": {
            "name": ORIGIN_NAME,
            "sw_version": env!("CARGO_PKG_VERSION"),
            "support_url": SUPPORT_URL,
        },
        "components": {
            format!("{}_temperature1", lower): sensor("temperature", "°C", "temperature", "t"),
            format!("{}_humidity1", lower): sensor("humidity", "%", "humidity", "h"),
            format!("{}_battery1", lower): sensor("battery", "%", "battery", "b"),
        },
        "state_topic": settings.state_topic(device),
    })
}

/// Domoticz `udevice` command for a temperature/humidity sensor.
pub fn domoticz_payload(idx: u32, reading: &Reading) -> Value {
    json!({
        "command": "udevice",
        "idx": idx,
        "svalue": format!("{:.1};{:.1};0", reading.temperature, reading.humidity),
    })
}

/// Publisher backed by a rumqttc client.
///
/// The client's event loop runs in a background task started by
/// [`MqttPublisher::start`]; publishing only enqueues requests.
pub struct MqttPublisher {
    client: AsyncClient,
    settings: MqttSettings,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Create the client and start driving its event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(settings: MqttSettings) -> Self {
        let (client, event_loop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        info!(
            "MQTT broker {}:{} as {}",
            settings.host, settings.port, settings.client_id
        );
        let handle = tokio::spawn(drive(event_loop));

        Self {
            client,
            settings,
            event_loop: Mutex::new(Some(handle)),
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Flush queued messages and disconnect, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        // The disconnect request queues behind unsent publishes, so it shares the deadline.
        let deadline = tokio::time::Instant::now() + grace;
        match tokio::time::timeout_at(deadline, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("MQTT disconnect request failed: {}", e),
            Err(_) => warn!("MQTT request queue still full after {:?}", grace),
        }
        let Some(mut handle) = self.event_loop.lock().take() else {
            return;
        };
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            warn!("MQTT event loop did not stop within {:?}", grace);
            handle.abort();
        }
    }

    fn send(&self, topic: String, payload: Vec<u8>) {
        let size = payload.len();
        match self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, true, payload)
        {
            Ok(()) => debug!("Sent to MQTT {} ({} bytes)", topic, size),
            Err(e) => warn!("Failed to queue MQTT message for {}: {}", topic, e),
        }
    }

    fn send_json(&self, topic: String, payload: &Value) {
        debug!("MQTT {}: {}", topic, payload);
        self.send(topic, payload.to_string().into_bytes());
    }
}

impl Publisher for MqttPublisher {
    fn publish_discovery(&self, device: &DeviceIdentity) {
        if !self.settings.discovery {
            return;
        }
        let payload = discovery_payload(&self.settings, device);
        self.send_json(self.settings.discovery_topic(device), &payload);
    }

    fn retract_discovery(&self, device: &DeviceIdentity) {
        if !self.settings.discovery {
            return;
        }
        self.send(self.settings.discovery_topic(device), Vec::new());
    }

    fn publish_reading(&self, device: &DeviceIdentity, reading: &Reading) {
        match serde_json::to_value(reading) {
            Ok(payload) => self.send_json(self.settings.state_topic(device), &payload),
            Err(e) => error!("[{}] Failed to encode reading: {}", device.name, e),
        }

        if let Some(idx) = device.integration_id {
            self.send_json(DOMOTICZ_TOPIC.to_string(), &domoticz_payload(idx, reading));
        }
    }

    fn publish_diagnostic(&self, device: &DeviceIdentity, diagnostic: &Diagnostic) {
        debug!(
            "[{}] {}: {}",
            device.name, diagnostic.category, diagnostic.detail
        );
        if !self.settings.publish_diagnostics {
            return;
        }
        let payload = json!({
            "device": self.settings.unique_id(device),
            "category": diagnostic.category.as_str(),
            "detail": diagnostic.detail,
        });
        self.send_json(self.settings.diagnostic_topic(device), &payload);
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

/// Poll the event loop until the client disconnects.
async fn drive(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT connected"),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("MQTT disconnected by broker"),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT client disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BatteryScale;
    use pretty_assertions::assert_eq;

    fn identity(idx: Option<u32>) -> DeviceIdentity {
        DeviceIdentity::new(
            "C8:33:DE:43:2C:00".parse().unwrap(),
            "LT Bureau".to_string(),
            idx,
        )
    }

    #[test]
    fn test_default_settings() {
        let settings = MqttSettings::default();
        assert!(settings.enable);
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.prefix, "lt_temp/");
        assert_eq!(settings.discovery_prefix, "homeassistant/");
        assert!(!settings.publish_diagnostics);
    }

    #[test]
    fn test_topics() {
        let settings = MqttSettings::default();
        let device = identity(None);
        assert_eq!(settings.state_topic(&device), "lt_temp/LTBureau/state");
        assert_eq!(
            settings.discovery_topic(&device),
            "homeassistant/device/LTBureau/config"
        );
        assert_eq!(
            settings.diagnostic_topic(&device),
            "lt_temp/LTBureau/diagnostic"
        );
    }

    #[test]
    fn test_unique_id() {
        let settings = MqttSettings::default();
        assert_eq!(settings.unique_id(&identity(None)), "lt_tempC833DE432C00");
    }

    #[test]
    fn test_discovery_payload() {
        let settings = MqttSettings::default();
        let payload = discovery_payload(&settings, &identity(None));

        assert_eq!(payload["device"], json!({"ids": "LTBureau", "name": "LT Bureau"}));
        assert_eq!(payload["origin"]["name"], "blelt2mqtt");
        assert_eq!(payload["origin"]["support_url"], SUPPORT_URL);
        assert_eq!(payload["state_topic"], "lt_temp/LTBureau/state");
        assert_eq!(
            payload["components"]["ltbureau_temperature1"],
            json!({
                "platform": "sensor",
                "device_class": "temperature",
                "unit_of_measurement": "°C",
                "value_template": "{{ value_json.temperature}}",
                "unique_id": "LTBureau_t",
            })
        );
        assert_eq!(
            payload["components"]["ltbureau_humidity1"]["unique_id"],
            "LTBureau_h"
        );
        assert_eq!(
            payload["components"]["ltbureau_battery1"]["value_template"],
            "{{ value_json.battery}}"
        );
    }

    #[test]
    fn test_domoticz_payload() {
        let reading = Reading::from_raw(235, 450, 80, 0, BatteryScale::Hundredfold);
        assert_eq!(
            domoticz_payload(39, &reading),
            json!({"command": "udevice", "idx": 39, "svalue": "23.5;45.0;0"})
        );
    }

    #[test]
    fn test_settings_reject_unknown_keys() {
        let result: std::result::Result<MqttSettings, _> =
            serde_json::from_value(json!({"host": "broker", "hots": "typo"}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publishing_never_blocks_without_broker() {
        let settings = MqttSettings {
            port: 1,
            publish_diagnostics: true,
            ..MqttSettings::default()
        };
        let publisher = MqttPublisher::start(settings);
        let device = identity(Some(7));
        let reading = Reading::from_raw(-12, 999, 1, 0, BatteryScale::Raw);

        publisher.publish_discovery(&device);
        publisher.publish_reading(&device, &reading);
        publisher.publish_diagnostic(
            &device,
            &Diagnostic::new(crate::publisher::DiagnosticCategory::HourData, "aa, aa"),
        );
        publisher.retract_discovery(&device);

        publisher.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_shutdown_with_full_queue_respects_grace() {
        let settings = MqttSettings {
            port: 1,
            ..MqttSettings::default()
        };
        let publisher = MqttPublisher::start(settings);
        let device = identity(None);
        let reading = Reading::from_raw(235, 450, 80, 0, BatteryScale::Hundredfold);

        for _ in 0..(REQUEST_CAPACITY * 2) {
            publisher.publish_reading(&device, &reading);
        }

        let finished =
            tokio::time::timeout(Duration::from_secs(5), publisher.shutdown(Duration::from_millis(50)))
                .await;
        assert!(finished.is_ok(), "shutdown blocked on a full request queue");
        assert!(publisher.event_loop.lock().is_none());
    }
}
