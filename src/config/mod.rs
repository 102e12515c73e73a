//! Configuration Module
//!
//! TOML-based configuration for an lwmqtt client:
//! - Client identity and session timing
//! - Broker address, keepalive, credentials
//! - TLS and TCP keepalive tuning
//! - Environment variable overrides (LWMQTT__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::client::HandlerErrorPolicy;
use crate::codec::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::transport::{SocketKeepalive, TlsConfig};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(format!("Invalid substitution pattern: {}", e)))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client identity and session behavior
    pub client: ClientConfig,
    /// Broker connection parameters
    pub broker: BrokerConfig,
}

/// Client identity and session timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identifier sent in CONNECT
    pub client_id: String,
    /// Ask the broker to discard session state on connect
    pub clean_session: bool,
    /// Upper bound on one receive cycle (e.g., "500ms")
    #[serde(with = "humantime_serde")]
    pub cycle_timeout: Duration,
    /// Upper bound on waiting for an acknowledgement
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Upper bound on establishing the TCP/TLS connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Sleep between checks while `disconnect` waits for the loop
    #[serde(with = "humantime_serde")]
    pub disconnect_poll_interval: Duration,
    /// Inbound messages held between dispatch passes
    pub mailbox_capacity: usize,
    /// Largest inbound packet accepted, in bytes
    pub max_packet_size: usize,
    /// What the receive loop does when a handler fails
    pub handler_error_policy: HandlerErrorPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            cycle_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            disconnect_poll_interval: Duration::from_millis(10),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            handler_error_policy: HandlerErrorPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }
}

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname or IP address
    pub host: String,
    /// Broker port (1883 plain, 8883 conventional for TLS)
    pub port: u16,
    /// Keepalive in seconds, 0 disables pings
    pub keepalive: u16,
    /// TLS settings; plain TCP when absent
    pub tls: Option<TlsConfig>,
    /// TCP keepalive tuning; OS defaults when absent
    pub socket_keepalive: Option<SocketKeepalive>,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Start the receive loop after connecting
    pub start_loop: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive: 60,
            tls: None,
            socket_keepalive: None,
            username: None,
            password: None,
            start_loop: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `LWMQTT__` prefix with double underscores for nesting:
    ///    - `LWMQTT__BROKER__HOST=broker.local` overrides `broker.host`
    ///    - `LWMQTT__CLIENT__CYCLE_TIMEOUT=250ms` overrides `client.cycle_timeout`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("client.client_id", "")?
            .set_default("client.clean_session", true)?
            .set_default("client.cycle_timeout", "500ms")?
            .set_default("client.command_timeout", "5s")?
            .set_default("client.connect_timeout", "10s")?
            .set_default("client.disconnect_poll_interval", "10ms")?
            .set_default("client.mailbox_capacity", DEFAULT_MAILBOX_CAPACITY as u64)?
            .set_default("client.max_packet_size", DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("client.handler_error_policy", "stop_loop")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", 1883)?
            .set_default("broker.keepalive", 60)?
            .set_default("broker.start_loop", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("LWMQTT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;

        if client.client_id.is_empty() && !client.clean_session {
            return Err(ConfigError::Validation(
                "client_id is required when clean_session is false".to_string(),
            ));
        }

        for (name, value) in [
            ("cycle_timeout", client.cycle_timeout),
            ("command_timeout", client.command_timeout),
            ("connect_timeout", client.connect_timeout),
            ("disconnect_poll_interval", client.disconnect_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if client.mailbox_capacity == 0 {
            return Err(ConfigError::Validation(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }

        if client.max_packet_size == 0 || client.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }

        let broker = &self.broker;
        if broker.host.is_empty() {
            return Err(ConfigError::Validation("broker.host is required".to_string()));
        }
        if broker.port == 0 {
            return Err(ConfigError::Validation(
                "broker.port must be non-zero".to_string(),
            ));
        }

        // MQTT 3.1.1 forbids a password without a username
        if broker.password.is_some() && broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }

        if let Some(tls) = &broker.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(ConfigError::Validation(
                    "tls.client_cert and tls.client_key must be set together".to_string(),
                ));
            }
        }

        Ok(())
    }
}
