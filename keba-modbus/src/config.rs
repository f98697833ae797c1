//! Configuration for the polling engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::FrameValidation;
use crate::transport::DeviceAddress;

/// Standard Modbus/TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The charging station to poll.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Cycle timing and failure handling.
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Connection settings for the charging station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host name or IP address (required).
    #[serde(default)]
    pub host: String,

    /// TCP port (default: 502).
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit id (default: 255).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-register response timeout in milliseconds (default: 300).
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Connection establishment timeout in milliseconds (default: 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Transaction id sent with every request (default: 1).
    #[serde(default = "default_transaction_id")]
    pub transaction_id: u16,

    /// Response checks before decoding (default: lenient).
    #[serde(default)]
    pub validation: FrameValidation,
}

fn default_modbus_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_unit_id() -> u8 {
    255
}

fn default_response_timeout_ms() -> u64 {
    300
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_transaction_id() -> u16 {
    1
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_modbus_port(),
            unit_id: default_unit_id(),
            response_timeout_ms: default_response_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            transaction_id: default_transaction_id(),
            validation: FrameValidation::default(),
        }
    }
}

impl DeviceConfig {
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.host.clone(), self.port)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Cycle timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Sleep between cycles in seconds (default: 60).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Pause after every register read in milliseconds (default: 1000).
    #[serde(default = "default_register_delay_ms")]
    pub register_delay_ms: u64,

    /// What to do when a cycle fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_register_delay_ms() -> u64 {
    1000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            register_delay_ms: default_register_delay_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn register_delay(&self) -> Duration {
        Duration::from_millis(self.register_delay_ms)
    }
}

/// Reaction to a failed poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop polling and report the error; a supervisor restarts the process.
    #[default]
    FailFast,
    /// Log the error and start a new cycle after an exponential backoff.
    Retry {
        #[serde(default = "default_initial_backoff_secs")]
        initial_backoff_secs: u64,
        #[serde(default = "default_max_backoff_secs")]
        max_backoff_secs: u64,
    },
}

fn default_initial_backoff_secs() -> u64 {
    5
}

fn default_max_backoff_secs() -> u64 {
    300
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.device.host.trim().is_empty() {
            return Err("device host is required (set wallboxName)".to_string());
        }

        if self.device.port == 0 {
            return Err("device port must be 1-65535".to_string());
        }

        if self.device.response_timeout_ms == 0 {
            return Err("response_timeout_ms must be > 0".to_string());
        }

        if self.device.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be > 0".to_string());
        }

        if self.polling.interval_secs == 0 {
            return Err("interval_secs must be > 0".to_string());
        }

        if let FailurePolicy::Retry {
            initial_backoff_secs,
            max_backoff_secs,
        } = self.polling.failure_policy
        {
            if initial_backoff_secs == 0 {
                return Err("initial_backoff_secs must be > 0".to_string());
            }
            if max_backoff_secs < initial_backoff_secs {
                return Err("max_backoff_secs must be >= initial_backoff_secs".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            device: DeviceConfig {
                host: "192.168.1.50".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config: EngineConfig = json5::from_str("{ device: { host: 'wallbox' } }").unwrap();

        assert_eq!(config.device.port, 502);
        assert_eq!(config.device.unit_id, 255);
        assert_eq!(config.device.response_timeout(), Duration::from_millis(300));
        assert_eq!(config.device.transaction_id, 1);
        assert_eq!(config.device.validation, FrameValidation::Lenient);
        assert_eq!(config.polling.interval(), Duration::from_secs(60));
        assert_eq!(config.polling.register_delay(), Duration::from_secs(1));
        assert_eq!(config.polling.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_parse_retry_policy() {
        let json = r#"{
            device: { host: "wallbox", validation: "strict" },
            polling: {
                interval_secs: 30,
                failure_policy: { mode: "retry", initial_backoff_secs: 2 }
            }
        }"#;

        let config: EngineConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.device.validation, FrameValidation::Strict);
        assert_eq!(config.polling.interval_secs, 30);
        assert_eq!(
            config.polling.failure_policy,
            FailurePolicy::Retry {
                initial_backoff_secs: 2,
                max_backoff_secs: 300
            }
        );
    }

    #[test]
    fn test_validate_missing_host() {
        let config = EngineConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.contains("host is required"));

        let config = EngineConfig {
            device: DeviceConfig {
                host: "   ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = valid();
        config.polling.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut config = valid();
        config.polling.failure_policy = FailurePolicy::Retry {
            initial_backoff_secs: 10,
            max_backoff_secs: 5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_address() {
        let config = valid();
        assert_eq!(config.device.address().to_string(), "192.168.1.50:502");
        assert!(config.validate().is_ok());
    }
}
