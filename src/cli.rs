//! Command-line interface definitions and parsing

use clap::Parser;
use std::path::PathBuf;

use crate::config::LogLevel;

/// Bridge LT Thermometer BLE sensors to MQTT.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults to ./blelt2mqtt.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log readings instead of publishing them to MQTT
    #[arg(long)]
    pub no_mqtt: bool,

    /// Validate the configuration, list the devices and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Log level after applying `--verbose` on top of the configured one.
    pub fn log_level(&self, configured: LogLevel) -> LogLevel {
        match self.verbose {
            0 => configured,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}
