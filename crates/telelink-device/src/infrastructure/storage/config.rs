//! TOML configuration for the device binary.
//!
//! ```toml
//! [device]
//! node_id = 1
//! modbus_frequency = 5.0
//! log_send_interval = 900
//!
//! [[connections]]
//! serial = "TL-0000000000001"
//! key = "0123456789abcdef"
//! host = "telemetry.example.net"
//! port = 7700
//! cipher = "xtea"
//!
//! [[datasets]]
//! name = "energy"
//! kind = "integral"
//! register = 4
//! scale = 0.1
//!
//! [[setup]]
//! key = "mode"
//! value = 1
//! register = 10
//! forced = true
//! ```
//!
//! Every field except the identity of a connection and the name/register of
//! a dataset has a default, so a minimal file is valid.  Timing fields are
//! seconds as floating point numbers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use telelink_core::{
    CipherKind, ConfigurationError, Dataset, DatasetKind, Identity, SetupEntry, SetupMap,
};
use thiserror::Error;

use crate::application::device::DeviceSettings;
use crate::infrastructure::network::ConnectionSettings;

/// Error type for loading and interpreting the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("connection {serial:?}: {source}")]
    Identity {
        serial: String,
        #[source]
        source: ConfigurationError,
    },

    /// A timing field is negative, NaN or too large.
    #[error("{field} must be a non-negative number of seconds, got {value}")]
    InvalidDuration { field: &'static str, value: f64 },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
    #[serde(default)]
    pub setup: Vec<SetupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Bus address passed to the register source.
    #[serde(default = "default_node_id")]
    pub node_id: u8,
    /// Register polling period.  `0` disables polling.
    #[serde(default = "default_modbus_frequency")]
    pub modbus_frequency: f64,
    #[serde(default)]
    pub register_start: u16,
    #[serde(default = "default_register_count")]
    pub register_count: u16,
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval: f64,
    /// Push a log snapshot unprompted this often.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_send_interval: Option<f64>,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEntry {
    pub serial: String,
    /// Shared key as text; its bytes are the cipher key.
    pub key: String,
    pub host: String,
    pub port: u16,
    /// Payload cipher; `"xtea"` unless the server expects `"blowfish"`.
    #[serde(default)]
    pub cipher: CipherKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_backoff: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetEntry {
    pub name: String,
    pub kind: DatasetKind,
    pub register: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_node_id() -> u8 {
    1
}
fn default_modbus_frequency() -> f64 {
    5.0
}
fn default_register_count() -> u16 {
    64
}
fn default_supervisor_interval() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_scale() -> f64 {
    1.0
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            modbus_frequency: default_modbus_frequency(),
            register_start: 0,
            register_count: default_register_count(),
            supervisor_interval: default_supervisor_interval(),
            log_send_interval: None,
            log_level: default_log_level(),
        }
    }
}

// ── Conversion to runtime types ───────────────────────────────────────────────

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field, value })
}

impl DeviceConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDuration`] for a bad timing field.
    pub fn settings(&self) -> Result<DeviceSettings, ConfigError> {
        Ok(DeviceSettings {
            node_id: self.node_id,
            modbus_frequency: seconds("modbus_frequency", self.modbus_frequency)?,
            register_start: self.register_start,
            register_count: self.register_count,
            supervisor_interval: seconds("supervisor_interval", self.supervisor_interval)?,
            log_send_interval: self
                .log_send_interval
                .map(|v| seconds("log_send_interval", v))
                .transpose()?,
        })
    }
}

impl ConnectionEntry {
    /// # Errors
    ///
    /// Returns [`ConfigError::Identity`] if the serial, key, host or port is
    /// invalid.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        Identity::new(&self.serial, self.key.as_bytes(), self.host.clone(), self.port).map_err(
            |source| ConfigError::Identity {
                serial: self.serial.clone(),
                source,
            },
        )
    }

    /// Defaults overridden by whichever timing fields are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDuration`] for a bad timing field.
    pub fn settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let mut settings = ConnectionSettings {
            cipher: self.cipher,
            ..ConnectionSettings::default()
        };
        if let Some(v) = self.ack_timeout {
            settings.ack_timeout = seconds("ack_timeout", v)?;
        }
        if let Some(v) = self.keepalive_timeout {
            settings.keepalive_timeout = seconds("keepalive_timeout", v)?;
        }
        if let Some(attempts) = self.connect_attempts {
            settings.connect_attempts = attempts;
        }
        if let Some(v) = self.connect_backoff {
            settings.connect_backoff = seconds("connect_backoff", v)?;
        }
        Ok(settings)
    }
}

impl DatasetEntry {
    pub fn dataset(&self) -> Dataset {
        Dataset::new(self.name.clone(), self.kind, self.register).with_scale(self.scale)
    }
}

impl AppConfig {
    pub fn datasets(&self) -> Vec<Dataset> {
        self.datasets.iter().map(DatasetEntry::dataset).collect()
    }

    pub fn setup_map(&self) -> SetupMap {
        self.setup.iter().cloned().collect()
    }

    /// Validates every connection up front so a bad entry fails before any
    /// socket is opened.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn connections(&self) -> Result<Vec<(Identity, ConnectionSettings)>, ConfigError> {
        self.connections
            .iter()
            .map(|entry| Ok((entry.identity()?, entry.settings()?)))
            .collect()
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses configuration text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Loads `AppConfig` from `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
