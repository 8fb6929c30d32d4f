//! blelt2mqtt: LT Thermometer BLE sensors to MQTT.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use blelt2mqtt::cli::Cli;
use blelt2mqtt::config::{BridgeConfig, LogLevel};
use blelt2mqtt::{
    BtleplugTransport, LogPublisher, MqttPublisher, Publisher, Signal, Supervisor,
    DEFAULT_SHUTDOWN_GRACE,
};

/// Time allowed for queued MQTT messages (retractions mostly) to go out.
const MQTT_FLUSH_GRACE: Duration = Duration::from_secs(2);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging needs the configured level, so load first and report errors after.
    let loaded = BridgeConfig::load(cli.config.as_deref());
    let configured = loaded
        .as_ref()
        .map(|config| config.log.level)
        .unwrap_or_default();
    setup_logging(cli.log_level(configured));

    let mut config = loaded.context("Failed to load configuration")?;
    if cli.no_mqtt {
        config.mqtt.enable = false;
    }

    if cli.check_config {
        print_devices(&config);
        return Ok(());
    }

    let mut transport = match BtleplugTransport::new(config.ble.scan_timeout()).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("Bluetooth interface not ready for use: {}", e);
            std::process::exit(1);
        }
    };
    transport.set_connect_timeout(config.ble.connect_timeout());

    let mqtt = config
        .mqtt
        .enable
        .then(|| Arc::new(MqttPublisher::start(config.mqtt.clone())));
    let publisher: Arc<dyn Publisher> = match &mqtt {
        Some(mqtt) => mqtt.clone(),
        None => {
            info!("MQTT disabled, readings are only logged");
            Arc::new(LogPublisher::new())
        }
    };

    let supervisor = Supervisor::new(Arc::new(transport), publisher, config.session_configs())?
        .with_grace(DEFAULT_SHUTDOWN_GRACE);

    let interrupted = Signal::new();
    let reports = {
        let interrupted = interrupted.clone();
        supervisor
            .run_until(async move {
                match wait_for_termination().await {
                    Ok(name) => info!("Received {}", name),
                    Err(e) => {
                        warn!("Signal handling unavailable: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
                interrupted.fire();
            })
            .await
    };

    if let Some(mqtt) = &mqtt {
        mqtt.shutdown(MQTT_FLUSH_GRACE).await;
    }

    let failed = reports.iter().filter(|r| r.outcome.is_failure()).count();
    if interrupted.is_fired() {
        info!("Exit by user");
    } else {
        info!(
            "All sessions finished ({} of {} with errors)",
            failed,
            reports.len()
        );
    }
    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` wins over the computed level.
fn setup_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_devices(config: &BridgeConfig) {
    println!("Configuration OK, {} device(s):", config.devices.len());
    for device in &config.devices {
        println!(
            "  {}  name={}  domoticz_idx={}  wait={}s",
            device.mac,
            device.custom_name.as_deref().unwrap_or("-"),
            device
                .domoticz_idx
                .map(|idx| idx.to_string())
                .unwrap_or_else(|| "-".to_string()),
            device.wait.unwrap_or(config.ble.idle_wait_secs),
        );
    }
    if config.mqtt.enable {
        println!(
            "MQTT broker {}:{}, state topics under {}",
            config.mqtt.host, config.mqtt.port, config.mqtt.prefix
        );
    } else {
        println!("MQTT disabled");
    }
}

/// Wait for Ctrl-C, or SIGTERM on Unix. Returns the signal name.
async fn wait_for_termination() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
    }
}
