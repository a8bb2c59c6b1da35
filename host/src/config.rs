//! Server configuration.
//!
//! A small TOML-backed config covering the loop inputs and logging.
//! Every field has a default so an empty file (or no file) is a valid
//! configuration.

use crate::server::RunOptions;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration load failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address, `host:port`. Port 0 asks for an ephemeral port.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Wall-clock run duration in seconds; 0 runs until interrupted.
    #[serde(default)]
    pub duration_secs: u64,

    /// Queue poll interval in milliseconds.
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,

    /// Shutdown notification grace period in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_bind() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_queue_poll_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            duration_secs: 0,
            queue_poll_ms: default_queue_poll_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Derive loop options. The interrupt flag is the host's to supply.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            duration: Duration::from_secs(self.duration_secs),
            interrupt: None,
            queue_poll: Duration::from_millis(self.queue_poll_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level filter when RUST_LOG is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path).
    #[serde(default)]
    pub target: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Pretty,
            timestamps: true,
            target: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
