//! # Configuration Management
//!
//! Centralized configuration for the messenger.
//!
//! This module provides structured configuration for servers and clients, per-connection
//! reliability and flow-control tuning, MTU discovery, flood mitigation, link simulation
//! and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Programmatic overrides via `default_with_overrides()`
//!
//! Values are plain data; nothing is read from the environment.

use crate::error::{ProtocolError, Result};
use crate::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Smallest datagram payload every IPv4 path must deliver (576 - 60 - 8)
pub const SAFE_MTU: usize = 508;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Max allowed logical packet size after reassembly/decompression (1 MB)
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Whether to enable compression by default
pub const ENABLE_COMPRESSION: bool = false;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-role settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-role settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-connection reliability and flow control
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// MTU, payload limits and compression
    #[serde(default)]
    pub transport: TransportConfig,

    /// Watch/ignore tables for abusive endpoints
    #[serde(default)]
    pub flood: FloodConfig,

    /// Simulated latency/loss (test aid)
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.flood.validate());
        errors.extend(self.simulation.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-role configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:7777")
    pub address: String,

    /// Maximum number of tracked plus provisional connections
    pub max_connections: usize,

    /// Password a `ConnectionRequest` must carry, if any
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:7777"),
            max_connections: 32,
            password: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:7777')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if let Some(password) = &self.password {
            if password.is_empty() {
                errors.push("Password must not be empty when set".to_string());
            }
        }

        errors
    }
}

/// Client-role configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// How many `ConnectionRequest`s are sent before giving up
    pub max_connection_attempts: u32,

    /// How long each attempt waits for an answer
    #[serde(with = "duration_serde")]
    pub connection_attempt_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connection_attempts: 5,
            connection_attempt_timeout: Duration::from_millis(1000),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connection_attempts == 0 {
            errors.push("Max connection attempts must be greater than 0".to_string());
        }

        if self.connection_attempt_timeout.as_millis() < 10 {
            errors.push("Connection attempt timeout too short (minimum: 10ms)".to_string());
        } else if self.connection_attempt_timeout.as_secs() > 60 {
            errors.push("Connection attempt timeout too long (maximum: 60s)".to_string());
        }

        errors
    }

    /// Upper bound on how long `connect` blocks the calling thread
    pub fn total_connect_timeout(&self) -> Duration {
        self.connection_attempt_timeout * self.max_connection_attempts
    }
}

/// Per-connection reliability, ping and throttling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Silence after which a connection is considered lost
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Base time to wait for an ack before resending (current ping is added)
    #[serde(with = "duration_serde")]
    pub ack_await_delay: Duration,

    /// Interval between ping requests
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Number of round-trip samples averaged per window
    pub ping_window: usize,

    /// Average ping above `base + threshold` drops to the throttled tier
    #[serde(with = "duration_serde")]
    pub ping_spike_threshold: Duration,

    /// Average ping below `base - threshold` re-baselines
    #[serde(with = "duration_serde")]
    pub ping_rebaseline_threshold: Duration,

    /// Minimum time between two send-rate changes
    #[serde(with = "duration_serde")]
    pub rate_change_cooldown: Duration,

    /// Heartbeats per second in the normal tier
    pub send_rate: u32,

    /// Heartbeats per second in the throttled tier
    pub throttled_send_rate: u32,

    /// How long small packets may wait to be chunked in the normal tier
    #[serde(with = "duration_serde")]
    pub chunk_send_interval: Duration,

    /// How long small packets may wait to be chunked in the throttled tier
    #[serde(with = "duration_serde")]
    pub throttled_chunk_send_interval: Duration,

    /// Number of recently handled inbound ids remembered for duplicate suppression
    pub duplicate_window: usize,

    /// Pending RPC function callbacks older than this are dropped
    #[serde(with = "duration_serde")]
    pub function_call_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            ack_await_delay: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
            ping_window: 5,
            ping_spike_threshold: Duration::from_millis(80),
            ping_rebaseline_threshold: Duration::from_millis(20),
            rate_change_cooldown: Duration::from_secs(5),
            send_rate: 60,
            throttled_send_rate: 20,
            chunk_send_interval: Duration::from_millis(15),
            throttled_chunk_send_interval: Duration::from_millis(50),
            duplicate_window: 1024,
            function_call_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.ack_await_delay.is_zero() {
            errors.push("Ack await delay must be greater than 0".to_string());
        } else if self.ack_await_delay >= self.connection_timeout {
            errors.push("Ack await delay must be shorter than the connection timeout".to_string());
        }

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        } else if self.ping_interval >= self.connection_timeout {
            errors.push("Ping interval must be shorter than the connection timeout".to_string());
        }

        if self.ping_window == 0 {
            errors.push("Ping window must hold at least one sample".to_string());
        }

        if self.send_rate == 0 || self.throttled_send_rate == 0 {
            errors.push("Send rates must be greater than 0".to_string());
        } else if self.throttled_send_rate > self.send_rate {
            errors.push("Throttled send rate cannot exceed the normal send rate".to_string());
        }

        if self.throttled_chunk_send_interval < self.chunk_send_interval {
            errors.push(
                "Throttled chunk interval cannot be shorter than the normal chunk interval"
                    .to_string(),
            );
        }

        // ids are u16, a window of half the id space or more would flag fresh ids as duplicates
        if self.duplicate_window == 0 {
            errors.push("Duplicate window must be greater than 0".to_string());
        } else if self.duplicate_window > 16_384 {
            errors.push(format!(
                "Duplicate window too large: {} (maximum: 16384)",
                self.duplicate_window
            ));
        }

        errors
    }
}

/// MTU discovery, payload limits and compression configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// MTU assumed before discovery confirms anything larger
    pub min_mtu: usize,

    /// First probe size
    pub mtu_initial_probe: usize,

    /// Hard cap for discovered MTU
    pub max_mtu: usize,

    /// Unanswered attempts at one probe size before it counts as failed
    pub mtu_probe_attempts: u32,

    /// Whether MTU discovery runs at all
    pub mtu_discovery_enabled: bool,

    /// Maximum logical packet size in bytes
    pub max_packet_size: usize,

    /// Whether to compress payloads
    pub compression_enabled: bool,

    /// Compression algorithm used when enabled
    pub compression_kind: CompressionKind,

    /// Minimum payload size (bytes) before compression is attempted
    pub compression_threshold_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_mtu: SAFE_MTU,
            mtu_initial_probe: SAFE_MTU,
            max_mtu: 1400,
            mtu_probe_attempts: 2,
            mtu_discovery_enabled: true,
            max_packet_size: MAX_PACKET_SIZE,
            compression_enabled: ENABLE_COMPRESSION,
            compression_kind: CompressionKind::Lz4,
            compression_threshold_bytes: 512,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.min_mtu < 64 {
            errors.push("Minimum MTU too small (minimum: 64 bytes)".to_string());
        }

        if self.max_mtu > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Maximum MTU {} exceeds the largest UDP datagram ({MAX_DATAGRAM_SIZE})",
                self.max_mtu
            ));
        }

        if self.min_mtu > self.max_mtu {
            errors.push("Minimum MTU cannot exceed maximum MTU".to_string());
        }

        if self.mtu_initial_probe < self.min_mtu || self.mtu_initial_probe > self.max_mtu {
            errors.push("Initial MTU probe must lie between minimum and maximum MTU".to_string());
        }

        if self.mtu_discovery_enabled && self.mtu_probe_attempts == 0 {
            errors.push("MTU probe attempts must be greater than 0".to_string());
        }

        if self.max_packet_size < self.max_mtu {
            errors.push("Max packet size cannot be smaller than the maximum MTU".to_string());
        } else if self.max_packet_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Max packet size too large: {} bytes (maximum: 16 MB)",
                self.max_packet_size
            ));
        }

        if self.compression_enabled && self.compression_threshold_bytes > self.max_packet_size {
            errors.push("Compression threshold cannot be larger than max packet size".to_string());
        }

        errors
    }
}

/// Watch/ignore table configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FloodConfig {
    /// Malformed datagrams tolerated per endpoint per second before it is ignored
    pub warning_threshold: u32,

    /// First ignore period; doubles with every repeat offence
    #[serde(with = "duration_serde")]
    pub base_ignore_duration: Duration,

    /// Upper bound for the ignore period
    #[serde(with = "duration_serde")]
    pub max_ignore_duration: Duration,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 10,
            base_ignore_duration: Duration::from_secs(1),
            max_ignore_duration: Duration::from_secs(300),
        }
    }
}

impl FloodConfig {
    /// Validate flood configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.warning_threshold == 0 {
            errors.push("Flood warning threshold must be greater than 0".to_string());
        }

        if self.base_ignore_duration.is_zero() {
            errors.push("Base ignore duration must be greater than 0".to_string());
        } else if self.base_ignore_duration > self.max_ignore_duration {
            errors.push("Base ignore duration cannot exceed max ignore duration".to_string());
        }

        errors
    }
}

/// Simulated link conditions applied to inbound datagrams
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SimulationConfig {
    /// Delay inbound datagrams
    pub simulate_latency: bool,

    /// Fixed inbound delay
    #[serde(with = "duration_serde")]
    pub latency: Duration,

    /// Random extra delay up to this amount
    #[serde(with = "duration_serde")]
    pub jitter: Duration,

    /// Drop inbound datagrams at random
    pub simulate_loss: bool,

    /// Fraction of inbound datagrams dropped (0.0 - 1.0)
    pub loss_rate: f32,
}

impl SimulationConfig {
    /// Validate simulation configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.simulate_loss && !(0.0..=1.0).contains(&self.loss_rate) {
            errors.push(format!(
                "Invalid loss rate: {} (valid range: 0.0-1.0)",
                self.loss_rate
            ));
        }

        if self.simulate_latency && self.latency.as_secs() > 10 {
            errors.push("Simulated latency too long (maximum: 10s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("udp-messenger"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
