//! Configuration management for Galley
//!
//! Configuration comes from a TOML file, from `GALLEY_<SECTION>_<KEY>`
//! environment variables, or from the defaults below. Every loader runs
//! [`Config::validate`] before handing the value out.

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport listener configuration
    pub server: ServerConfig,

    /// Persistence configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Collaboration core tuning
    pub realtime: RealtimeConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Time allowed for connections to drain on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Interval between WebSocket pings
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Time to wait for a pong before the socket is closed
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Bearer token required by the internal domain event endpoint
    pub relay_token: Option<String>,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Maximum pooled connections
    pub pool_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// When the tenant room hears that a user came online
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresencePolicy {
    /// Every successful connect broadcasts `user:joined`
    EveryConnect,
    /// Only the empty -> non-empty transition broadcasts `user:joined`
    FirstConnection,
}

/// Which room learns about a newly created private channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAnnouncePolicy {
    /// Whole tenant room, regardless of privacy
    Tenant,
    /// Private channels are announced to their own room only
    Members,
}

/// Collaboration core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Typing indicator auto-expiry
    #[serde(with = "humantime_serde")]
    pub typing_timeout: Duration,

    /// Events buffered per connection before new ones are dropped
    pub outbound_buffer: usize,

    /// Commands buffered per connection before submitters wait
    pub command_queue: usize,

    /// Maximum message length in characters
    pub max_message_length: usize,

    /// Maximum channel name length in characters
    pub max_channel_name_length: usize,

    /// Maximum reaction emoji length in characters
    pub max_emoji_length: usize,

    pub presence_policy: PresencePolicy,

    pub private_channel_announce: ChannelAnnouncePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 10_000,
            shutdown_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            relay_token: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { database_path: PathBuf::from("./data/galley.db"), pool_size: 8 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_millis(3000),
            outbound_buffer: 256,
            command_queue: 64,
            max_message_length: 4000,
            max_channel_name_length: 80,
            max_emoji_length: 32,
            presence_policy: PresencePolicy::EveryConnect,
            private_channel_announce: ChannelAnnouncePolicy::Tenant,
        }
    }
}

impl FromStr for PresencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "every_connect" => Ok(PresencePolicy::EveryConnect),
            "first_connection" => Ok(PresencePolicy::FirstConnection),
            other => Err(format!("unknown presence policy '{}'", other)),
        }
    }
}

impl FromStr for ChannelAnnouncePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant" => Ok(ChannelAnnouncePolicy::Tenant),
            "members" => Ok(ChannelAnnouncePolicy::Members),
            other => Err(format!("unknown announce policy '{}'", other)),
        }
    }
}

/// Parse an environment variable if it is set
fn env_value<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Env {
            key: name,
            reason: e.to_string(),
            value: raw,
        }),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => match humantime_serde::re::humantime::parse_duration(&raw) {
            Ok(duration) => Ok(Some(duration)),
            Err(e) => Err(ConfigError::Env { key: name, reason: e.to_string(), value: raw }),
        },
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: GALLEY_<SECTION>_<KEY>
    /// Example: GALLEY_SERVER_BIND_ADDRESS=0.0.0.0:8080
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay any `GALLEY_*` variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Server config
        if let Some(addr) = env_value("GALLEY_SERVER_BIND_ADDRESS")? {
            self.server.bind_address = addr;
        }
        if let Some(max) = env_value("GALLEY_SERVER_MAX_CONNECTIONS")? {
            self.server.max_connections = max;
        }
        if let Some(timeout) = env_duration("GALLEY_SERVER_SHUTDOWN_TIMEOUT")? {
            self.server.shutdown_timeout = timeout;
        }
        if let Ok(token) = env::var("GALLEY_SERVER_RELAY_TOKEN") {
            self.server.relay_token = Some(token);
        }

        // Store config
        if let Ok(path) = env::var("GALLEY_STORE_DATABASE_PATH") {
            self.store.database_path = PathBuf::from(path);
        }
        if let Some(size) = env_value("GALLEY_STORE_POOL_SIZE")? {
            self.store.pool_size = size;
        }

        // Logging config
        if let Ok(level) = env::var("GALLEY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = env_value("GALLEY_LOG_JSON")? {
            self.logging.json_format = json;
        }

        // Realtime config
        if let Some(timeout) = env_duration("GALLEY_REALTIME_TYPING_TIMEOUT")? {
            self.realtime.typing_timeout = timeout;
        }
        if let Some(buffer) = env_value("GALLEY_REALTIME_OUTBOUND_BUFFER")? {
            self.realtime.outbound_buffer = buffer;
        }
        if let Some(policy) = env_value("GALLEY_REALTIME_PRESENCE_POLICY")? {
            self.realtime.presence_policy = policy;
        }
        if let Some(policy) = env_value("GALLEY_REALTIME_PRIVATE_CHANNEL_ANNOUNCE")? {
            self.realtime.private_channel_announce = policy;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid("server.max_connections", "must be greater than 0"));
        }
        if self.server.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid("server.heartbeat_interval", "must be non-zero"));
        }
        if self.server.heartbeat_timeout.is_zero() {
            return Err(ConfigError::invalid("server.heartbeat_timeout", "must be non-zero"));
        }
        // The relay endpoint may only run open on a loopback listener
        let relay_token = self.server.relay_token.as_deref().map(str::trim).unwrap_or_default();
        if relay_token.is_empty() && !self.server.bind_address.ip().is_loopback() {
            return Err(ConfigError::invalid(
                "server.relay_token",
                format!("required when binding to {}", self.server.bind_address),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", "must be greater than 0"));
        }
        if self.realtime.typing_timeout.is_zero() {
            return Err(ConfigError::invalid("realtime.typing_timeout", "must be non-zero"));
        }

        let sizes = [
            ("realtime.outbound_buffer", self.realtime.outbound_buffer),
            ("realtime.command_queue", self.realtime.command_queue),
            ("realtime.max_message_length", self.realtime.max_message_length),
            ("realtime.max_channel_name_length", self.realtime.max_channel_name_length),
            ("realtime.max_emoji_length", self.realtime.max_emoji_length),
        ];
        if let Some((field, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(ConfigError::invalid(*field, "must be greater than 0"));
        }

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| ConfigError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.realtime.typing_timeout, Duration::from_millis(3000));
        assert_eq!(config.realtime.presence_policy, PresencePolicy::EveryConnect);
        assert_eq!(config.realtime.private_channel_announce, ChannelAnnouncePolicy::Tenant);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.realtime.typing_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.realtime.outbound_buffer = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.store.pool_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.realtime.max_emoji_length = 0;
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "realtime.max_emoji_length"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_relay_token_required_off_loopback() {
        let mut config = Config::default();
        config.server.bind_address = "0.0.0.0:8080".parse().unwrap();
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "server.relay_token"),
            other => panic!("unexpected {:?}", other),
        }

        config.server.relay_token = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.server.relay_token = Some("s3cret".to_string());
        assert!(config.validate().is_ok());

        config = Config::default();
        config.server.bind_address = "[::1]:9000".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("galley.toml");

        let mut config = Config::default();
        config.realtime.typing_timeout = Duration::from_secs(5);
        config.realtime.presence_policy = PresencePolicy::FirstConnection;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.realtime.typing_timeout, Duration::from_secs(5));
        assert_eq!(loaded.realtime.presence_policy, PresencePolicy::FirstConnection);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[realtime]\ntyping_timeout = \"1s 500ms\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.realtime.typing_timeout, Duration::from_millis(1500));
        assert_eq!(loaded.server.max_connections, 10_000);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("members".parse::<ChannelAnnouncePolicy>(), Ok(ChannelAnnouncePolicy::Members));
        assert!("nobody".parse::<ChannelAnnouncePolicy>().is_err());
        assert_eq!(
            "first_connection".parse::<PresencePolicy>(),
            Ok(PresencePolicy::FirstConnection)
        );
    }
}
