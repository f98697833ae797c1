//! Configuration for the Prometheus exporter.
//!
//! Settings are layered: built-in defaults, then an optional JSON5 file, then
//! command-line flags and their environment variables ([`CliOverrides`]).

use std::net::SocketAddr;
use std::path::Path;

use keba_common::LoggingConfig;
use keba_modbus::{DeviceConfig, EngineConfig, PollingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] keba_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// The charging station to poll.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Poll cadence and failure handling.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "keba").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "keba".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

/// Settings given on the command line or through the environment.
///
/// These win over the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub debug: bool,
    pub listen: Option<String>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// The result is not validated yet: the device host may still come from
    /// [`CliOverrides`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(keba_common::load_config(path)?)
    }

    /// Parse configuration from a JSON5 string. Not validated.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(keba_common::parse_config(content)?)
    }

    /// Layer command-line and environment settings on top.
    pub fn apply(&mut self, overrides: CliOverrides) {
        if let Some(host) = overrides.host.filter(|h| !h.trim().is_empty()) {
            self.device.host = host;
        }

        if let Some(port) = overrides.port {
            self.device.port = port;
        }

        if let Some(listen) = overrides.listen {
            self.prometheus.listen = listen;
        }

        let logging = std::mem::take(&mut self.logging);
        self.logging = logging.with_debug(overrides.debug);
    }

    /// The polling engine's part of the configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            device: self.device.clone(),
            polling: self.polling.clone(),
        }
    }

    /// Parsed HTTP listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.prometheus.listen.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_config()
            .validate()
            .map_err(ConfigError::Validation)?;

        self.listen_addr()?;

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if matches!(self.prometheus.path.as_str(), "/health" | "/ready") {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} collides with a probe endpoint",
                self.prometheus.path
            )));
        }

        Ok(())
    }
}
