//! Configuration management for the tapo client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tapo/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tapo_protocol::Credential;
use thiserror::Error;

use crate::discovery::{DiscoveryScanner, DEFAULT_BROADCAST_ADDRESS, DEFAULT_DISCOVERY_PORT};
use crate::orchestrator::{ClientOptions, DEFAULT_MAX_RETRIES, DEFAULT_PORT};
use crate::transport::ProtocolPreference;

/// Upper bound on `client.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_retries must be at most 10, got {0}")]
    InvalidMaxRetries(u32),

    #[error("{0} must be greater than 0")]
    InvalidTimeout(&'static str),

    #[error("{0} must not be 0")]
    InvalidPort(&'static str),

    #[error("broadcast_address must not be empty")]
    InvalidBroadcastAddress,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the tapo client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Account credentials used to log in to devices.
    pub credentials: CredentialsConfig,

    /// Device connection settings.
    pub client: ClientConfig,

    /// Discovery scan settings.
    pub discovery: DiscoveryConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Account credentials.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Device connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP port of the device API.
    pub port: u16,

    /// `auto`, `passthrough` or `klap`.
    pub protocol: ProtocolPreference,

    /// Retries after a session timeout or rate limiting.
    pub max_retries: u32,

    /// Timeout for each HTTP request, in seconds.
    pub request_timeout_secs: u64,
}

/// Discovery scan settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Address the probe is broadcast to.
    pub broadcast_address: String,

    /// UDP port devices listen on.
    pub port: u16,

    /// How long to listen for replies, in seconds.
    pub timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            protocol: ProtocolPreference::Auto,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout_secs: 10,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_address: DEFAULT_BROADCAST_ADDRESS.to_string(),
            port: DEFAULT_DISCOVERY_PORT,
            timeout_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tapo")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TAPO_USERNAME: Override the account username
    /// - TAPO_PASSWORD: Override the account password
    /// - TAPO_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the names of the overridden settings. Values are not returned
    /// so callers can log the list once tracing is set up.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut overridden = Vec::new();

        if let Some(username) = env_value("TAPO_USERNAME") {
            self.credentials.username = username;
            overridden.push("credentials.username");
        }

        if let Some(password) = env_value("TAPO_PASSWORD") {
            self.credentials.password = password;
            overridden.push("credentials.password");
        }

        if let Some(level) = env_value("TAPO_LOG_LEVEL") {
            self.logging.log_level = level;
            overridden.push("logging.log_level");
        }

        overridden
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::InvalidMaxRetries(self.client.max_retries));
        }
        if self.client.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("client.request_timeout_secs"));
        }
        if self.client.port == 0 {
            return Err(ConfigError::InvalidPort("client.port"));
        }

        if self.discovery.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("discovery.timeout_secs"));
        }
        if self.discovery.port == 0 {
            return Err(ConfigError::InvalidPort("discovery.port"));
        }
        if self.discovery.broadcast_address.trim().is_empty() {
            return Err(ConfigError::InvalidBroadcastAddress);
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// The configured account credential.
    pub fn credential(&self) -> Credential {
        Credential::new(
            self.credentials.username.clone(),
            self.credentials.password.clone(),
        )
    }

    /// Connection options for [`crate::TapoClient`].
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            port: self.client.port,
            protocol: self.client.protocol,
            max_retries: self.client.max_retries,
            request_timeout: Duration::from_secs(self.client.request_timeout_secs),
        }
    }

    /// A scanner set up from the `[discovery]` section.
    pub fn discovery_scanner(&self) -> DiscoveryScanner {
        DiscoveryScanner::new()
            .broadcast_address(self.discovery.broadcast_address.clone())
            .port(self.discovery.port)
            .timeout(Duration::from_secs(self.discovery.timeout_secs))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

/// Non-empty value of an environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
