//! # Configuration Management
//!
//! Centralized configuration for the framed-message layer.
//!
//! This module provides structured configuration for servers and clients,
//! including endpoints, timeouts, queue capacities and receive-buffer sizing.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Sizing Considerations
//! - The dispatch queue capacity bounds how many inbound messages may wait for
//!   the next tick; anything beyond it is dropped with a single warning
//! - The receive buffer never grows past `max_message_size` plus the record header

use crate::core::record::RECORD_HEADER_LEN;
use crate::error::{ProtocolError, Result};
use crate::transport::endpoint::Endpoint;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Initial size of the threaded transport's receive buffer
pub const RECEIVE_BUFFER_INITIAL: usize = 4096;

/// Free space below which the receive buffer doubles
pub const RECEIVE_BUFFER_LOW_WATER: usize = 1024;

/// Default bound of the inbound dispatch queue
pub const DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// Default bound of a session's outbound send queue
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

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

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FRAMELINK_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(url) = std::env::var("FRAMELINK_CLIENT_URL") {
            config.client.url = url;
        }

        if let Ok(strategy) = std::env::var("FRAMELINK_CLIENT_STRATEGY") {
            config.client.strategy = match strategy.to_ascii_lowercase().as_str() {
                "threaded" => TransportStrategy::Threaded,
                "bridged" => TransportStrategy::Bridged,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown transport strategy: {other}"
                    )))
                }
            };
        }

        if let Ok(limit) = std::env::var("FRAMELINK_BACKPRESSURE_LIMIT") {
            if let Ok(val) = limit.parse::<usize>() {
                config.server.backpressure_limit = val;
            }
        }

        if let Ok(capacity) = std::env::var("FRAMELINK_DISPATCH_QUEUE_CAPACITY") {
            if let Ok(val) = capacity.parse::<usize>() {
                config.client.dispatch_queue_capacity = val;
            }
        }

        if let Ok(timeout) = std::env::var("FRAMELINK_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
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
        errors.extend(self.transport.validate());
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

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of records waiting in one session's outbound queue
    pub backpressure_limit: usize,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Sub-protocols this server accepts; empty accepts any offer
    #[serde(default)]
    pub sub_protocols: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            backpressure_limit: SEND_QUEUE_CAPACITY,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 1000,
            sub_protocols: Vec::new(),
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
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        if self.sub_protocols.iter().any(|p| p.is_empty() || p.contains(',')) {
            errors.push("Sub-protocol names must be non-empty and contain no commas".to_string());
        }

        errors
    }
}

/// Which client transport strategy the connector wires up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    /// Dedicated send and receive threads over a blocking socket
    #[default]
    Threaded,
    /// Socket owned by a foreign runtime behind a `SocketBridge`
    Bridged,
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target endpoint (e.g., "tcp://127.0.0.1:9000")
    pub url: String,

    /// Identifier stamped on inbound items of this client session
    #[serde(default)]
    pub session_id: u64,

    /// Transport strategy to use
    #[serde(default)]
    pub strategy: TransportStrategy,

    /// Sub-protocols offered during the opening handshake
    #[serde(default)]
    pub sub_protocols: Vec<String>,

    /// Timeout for connection attempts (socket connect plus handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How long to wait for the peer's close record
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// Maximum number of inbound messages waiting for the next tick
    pub dispatch_queue_capacity: usize,

    /// Maximum number of outbound frames waiting to be written
    pub send_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::from("tcp://127.0.0.1:9000"),
            session_id: 0,
            strategy: TransportStrategy::default(),
            sub_protocols: Vec::new(),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            close_timeout: timeout::CLOSE_TIMEOUT,
            dispatch_queue_capacity: DISPATCH_QUEUE_CAPACITY,
            send_queue_capacity: SEND_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.url.is_empty() {
            errors.push("Client URL cannot be empty".to_string());
        } else if let Err(e) = Endpoint::parse(&self.url) {
            errors.push(format!(
                "Invalid client URL: '{}' ({e}; expected format: 'tcp://example.com:8080')",
                self.url
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.close_timeout.as_millis() < 10 {
            errors.push("Close timeout too short (minimum: 10ms)".to_string());
        }

        if self.dispatch_queue_capacity == 0 {
            errors.push("Dispatch queue capacity must be greater than 0".to_string());
        }

        if self.send_queue_capacity == 0 {
            errors.push("Send queue capacity must be greater than 0".to_string());
        }

        if self.sub_protocols.iter().any(|p| p.is_empty() || p.contains(',')) {
            errors.push("Sub-protocol names must be non-empty and contain no commas".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed record body size in bytes
    pub max_message_size: usize,

    /// Initial receive buffer size for the threaded transport
    pub receive_buffer_initial: usize,

    /// Free space below which the receive buffer doubles
    pub receive_buffer_low_water: usize,

    /// Whether to set TCP_NODELAY on client and server sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_nodelay() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            receive_buffer_initial: RECEIVE_BUFFER_INITIAL,
            receive_buffer_low_water: RECEIVE_BUFFER_LOW_WATER,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Largest size the receive buffer may grow to
    pub fn receive_buffer_cap(&self) -> usize {
        self.max_message_size.saturating_add(RECORD_HEADER_LEN)
    }

    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_message_size
            ));
        }

        if self.receive_buffer_initial < RECORD_HEADER_LEN {
            errors.push(format!(
                "Receive buffer must hold at least a record header ({RECORD_HEADER_LEN} bytes)"
            ));
        }

        if self.receive_buffer_low_water == 0 {
            errors.push("Receive buffer low-water mark must be greater than 0".to_string());
        } else if self.receive_buffer_low_water >= self.receive_buffer_initial {
            errors.push(
                "Receive buffer low-water mark must be smaller than the initial size".to_string(),
            );
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framelink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
