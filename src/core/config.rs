//! Configuration management for cinder.
//!
//! Handles YAML file loading, environment variable overrides, CLI argument
//! overrides, validation and defaults.

use crate::cache::CacheSettings;
use crate::core::{CinderError, Result};
use crate::receiver::ReceiverSettings;
use serde::{Deserialize, Serialize};

/// Complete configuration for cinder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Aggregation cache sizing
    pub cache: CacheSettings,
    /// TCP listener
    pub tcp: TcpConfig,
    /// UDP listener
    pub udp: UdpConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// TCP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Listen address for the plaintext protocol
    pub listen: String,
    /// Whether the listener is bound
    pub enabled: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            listen: "127.0.0.1:2003".to_string(),
            enabled: true,
        }
    }
}

impl TcpConfig {
    /// Receiver settings for this section.
    pub fn to_settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            listen_addr: self.listen.clone(),
            enabled: self.enabled,
            log_incomplete: false,
        }
    }
}

/// UDP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Listen address for the plaintext protocol
    pub listen: String,
    /// Whether the listener is bound
    pub enabled: bool,
    /// Log datagrams with a truncated trailing line
    pub log_incomplete: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            listen: "127.0.0.1:2003".to_string(),
            enabled: true,
            log_incomplete: false,
        }
    }
}

impl UdpConfig {
    /// Receiver settings for this section.
    pub fn to_settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            listen_addr: self.listen.clone(),
            enabled: self.enabled,
            log_incomplete: self.log_incomplete,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured (target + thread) log format
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;

        if self.tcp.enabled && self.tcp.listen.is_empty() {
            return Err(CinderError::config("tcp.listen must not be empty"));
        }
        if self.udp.enabled && self.udp.listen.is_empty() {
            return Err(CinderError::config("udp.listen must not be empty"));
        }

        Ok(())
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| CinderError::config(format!("failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set TCP listen address
    pub fn tcp_listen(mut self, addr: String) -> Self {
        self.config.tcp.listen = addr;
        self
    }

    /// Set UDP listen address
    pub fn udp_listen(mut self, addr: String) -> Self {
        self.config.udp.listen = addr;
        self
    }

    /// Set cache capacity in samples
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.cache.max_size = max_size;
        self
    }

    /// Set the self-monitoring metric prefix
    pub fn graph_prefix(mut self, prefix: String) -> Self {
        self.config.cache.graph_prefix = prefix;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
