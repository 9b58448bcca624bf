//! Bus configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GEA2_CONFIG or --config)
//! 3. Environment variables

use gea2_protocol::{Address, BROADCAST_ADDRESS, DEFAULT_ADDRESS, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default capacity of the inbound message broadcast channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Complete bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    pub transport: TransportConfig,
    pub appliance: ApplianceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("GEA2_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.bus.apply_env_overrides();
        self.transport.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Addressing and timing for the bus layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address this participant sends from.
    pub source_address: Address,
    /// Default reply window for raw requests.
    pub response_timeout_ms: u64,
    /// Fixed reply window for queued ERD operations.
    pub erd_timeout_ms: u64,
    /// Capacity of inbound message broadcast channels.
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            source_address: DEFAULT_ADDRESS,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            erd_timeout_ms: DEFAULT_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl BusConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("GEA2_ADDRESS") {
            if let Ok(parsed) = gea2_protocol::parse_unsigned(&address) {
                if let Ok(address) = Address::try_from(parsed) {
                    self.source_address = address;
                }
            }
        }

        if let Ok(timeout) = std::env::var("GEA2_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.response_timeout_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("GEA2_ERD_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.erd_timeout_ms = ms;
            }
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn erd_timeout(&self) -> Duration {
        Duration::from_millis(self.erd_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_address == BROADCAST_ADDRESS {
            return Err(ConfigError::ValidationError(
                "bus.source_address cannot be the broadcast address".to_string(),
            ));
        }
        if self.response_timeout_ms == 0 || self.erd_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus timeouts must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "bus.event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Registry key of the transport implementation.
    pub kind: String,
    /// Bridge socket for the tcp transport.
    #[serde(with = "socket_addr_serde")]
    pub address: SocketAddr,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: "tcp".to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 7070)),
            connect_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("GEA2_TRANSPORT") {
            if !kind.is_empty() {
                self.kind = kind;
            }
        }

        if let Ok(addr) = std::env::var("GEA2_BRIDGE") {
            if let Ok(parsed) = addr.parse() {
                self.address = parsed;
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Application identity announced to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceConfig {
    /// Application version vector sent in reply to version queries.
    pub version: [u8; 4],
    /// Broadcast a version query right after binding.
    pub discover: bool,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            version: [0; 4],
            discover: true,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
