//! Engine configuration
//!
//! Loaded from JSON with camelCase keys. Every key is optional and falls
//! back to the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::engine::arbiter::{BackoffPolicy, DEFAULT_BACKOFF_MS};
use crate::engine::matcher::DuplicatePolicy;
use crate::protocol::assembler::DEFAULT_MIN_FRAME_BYTES;
use crate::protocol::{
    CommandDefaults, DEFAULT_APP_ADDRESS, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, DEFAULT_TRIES,
};

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serial parity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial flow control
///
/// Accepts either a name or a boolean, where `false` is [`FlowControl::None`]
/// and `true` is [`FlowControl::Hardware`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "FlowControlSetting")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlowControlSetting {
    Enabled(bool),
    Named(String),
}

impl TryFrom<FlowControlSetting> for FlowControl {
    type Error = String;

    fn try_from(setting: FlowControlSetting) -> Result<Self, Self::Error> {
        match setting {
            FlowControlSetting::Enabled(false) => Ok(FlowControl::None),
            FlowControlSetting::Enabled(true) => Ok(FlowControl::Hardware),
            FlowControlSetting::Named(name) => match name.to_ascii_lowercase().as_str() {
                "none" => Ok(FlowControl::None),
                "software" => Ok(FlowControl::Software),
                "hardware" => Ok(FlowControl::Hardware),
                other => Err(format!("unknown flow control '{}'", other)),
            },
        }
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Flow control
    pub flow_control: FlowControl,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

/// Per-family default response timeouts, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseTimeouts {
    /// Controller commands
    pub controller: u64,
    /// Pump commands
    pub pump: u64,
    /// Chlorinator commands
    pub chlorinator: u64,
}

impl Default for ResponseTimeouts {
    fn default() -> Self {
        Self {
            controller: DEFAULT_TIMEOUT_MS,
            pump: DEFAULT_TIMEOUT_MS,
            chlorinator: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Which transport the link opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local serial device
    Serial,
    /// TCP bridge to a remote serial device
    Net,
    /// In-memory transport driven by a [`crate::link::MockPeer`]
    Mock,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Serial device path
    #[serde(rename = "rs485Port")]
    pub rs485_port: String,
    /// Serial line settings
    pub port_settings: PortSettings,
    /// Use the in-memory transport
    pub mock_port: bool,
    /// Use TCP instead of a local device
    pub net_connect: bool,
    /// TCP host
    pub net_host: String,
    /// TCP port
    pub net_port: u16,
    /// Seconds of silence (or since a failed open) before reconnecting; 0 disables
    pub inactivity_retry: u64,
    /// Reject every enqueue
    pub suppress_write: bool,
    /// Default response timeouts per family
    pub response_timeouts: ResponseTimeouts,
    /// Default try budget per command
    pub default_retries: u32,
    /// Frame-processing tick
    pub process_interval_ms: u64,
    /// Collision-avoidance deferral
    pub backoff_interval_ms: u64,
    /// Enable collision avoidance
    pub collision_backoff: bool,
    /// Bytes to accumulate before attempting a new frame
    pub min_frame_bytes: usize,
    /// How many commands one reply may satisfy
    pub duplicate_responses: DuplicatePolicy,
    /// Queue a confirming `get` after controller `set` commands
    pub confirm_sets: bool,
    /// This node's bus address
    pub app_address: u8,
    /// JSON-lines capture file
    pub capture_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rs485_port: "/dev/ttyUSB0".to_string(),
            port_settings: PortSettings::default(),
            mock_port: false,
            net_connect: false,
            net_host: "raspberrypi".to_string(),
            net_port: 9801,
            inactivity_retry: 10,
            suppress_write: false,
            response_timeouts: ResponseTimeouts::default(),
            default_retries: DEFAULT_TRIES,
            process_interval_ms: 175,
            backoff_interval_ms: DEFAULT_BACKOFF_MS,
            collision_backoff: true,
            min_frame_bytes: DEFAULT_MIN_FRAME_BYTES,
            duplicate_responses: DuplicatePolicy::First,
            confirm_sets: false,
            app_address: DEFAULT_APP_ADDRESS,
            capture_path: None,
        }
    }
}

impl EngineConfig {
    /// Configuration for an in-memory bus
    pub fn mock() -> Self {
        Self {
            mock_port: true,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject settings no transport can use
    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.port_settings;
        if settings.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud rate must be non-zero".into()));
        }
        if !(5..=8).contains(&settings.data_bits) {
            return Err(ConfigError::Invalid(format!(
                "data bits must be 5-8, got {}",
                settings.data_bits
            )));
        }
        if !matches!(settings.stop_bits, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "stop bits must be 1 or 2, got {}",
                settings.stop_bits
            )));
        }
        if self.process_interval_ms == 0 {
            return Err(ConfigError::Invalid("process interval must be non-zero".into()));
        }
        match self.transport_kind() {
            TransportKind::Serial if self.rs485_port.trim().is_empty() => {
                Err(ConfigError::Invalid("serial port path is empty".into()))
            }
            TransportKind::Net if self.net_port == 0 => {
                Err(ConfigError::Invalid("net port must be non-zero".into()))
            }
            TransportKind::Net if self.net_host.trim().is_empty() => {
                Err(ConfigError::Invalid("net host is empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// Transport selected by the flags; mock wins over net
    pub fn transport_kind(&self) -> TransportKind {
        if self.mock_port {
            TransportKind::Mock
        } else if self.net_connect {
            TransportKind::Net
        } else {
            TransportKind::Serial
        }
    }

    /// TCP endpoint as `host:port`
    pub fn net_address(&self) -> String {
        format!("{}:{}", self.net_host, self.net_port)
    }

    /// Reconnect delay, `None` when reconnects are disabled
    pub fn inactivity_retry(&self) -> Option<Duration> {
        (self.inactivity_retry > 0).then(|| Duration::from_secs(self.inactivity_retry))
    }

    /// Frame-processing tick
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    /// Defaults for commands that leave tries or timeout unset
    pub fn command_defaults(&self) -> CommandDefaults {
        CommandDefaults {
            tries: self.default_retries,
            controller_timeout: Duration::from_millis(self.response_timeouts.controller),
            pump_timeout: Duration::from_millis(self.response_timeouts.pump),
            chlorinator_timeout: Duration::from_millis(self.response_timeouts.chlorinator),
        }
    }

    /// Collision-avoidance settings
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            enabled: self.collision_backoff,
            interval: Duration::from_millis(self.backoff_interval_ms),
        }
    }
}
