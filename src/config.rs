//! Configuration system for the hublink device client
//!
//! TOML configuration with `[device]`, `[hub]`, `[transport]` and `[retry]`
//! sections. Credentials are referenced by environment variable name and
//! resolved at runtime, never stored in the file.

use crate::retry::RetryPolicy;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main device client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub hub: HubSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Optional module identifier for module-scoped connections
    pub module_id: Option<String>,
}

/// Hub endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Hub hostname, without scheme
    pub hostname: String,
    /// Override the protocol default port
    pub port: Option<u16>,
    /// Environment variable containing the SAS token
    pub sas_token_env: Option<String>,
}

/// Transport selection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Protocol variant used for the device connection
    #[serde(default)]
    pub kind: TransportKind,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Per-operation timeout in seconds (default: 30)
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            keep_alive_secs: default_keep_alive_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_operation_timeout_secs() -> u64 {
    30
}

/// Retry policy section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Policy variant: "exponential-backoff", "fixed-interval" or "no-retry"
    #[serde(default)]
    pub policy: RetryPolicyKind,
    /// Minimum backoff in milliseconds (exponential policy)
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    /// Maximum backoff in milliseconds (exponential policy)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Give up after this much total elapsed time, in seconds (exponential policy)
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
    /// Interval in milliseconds (fixed-interval policy)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum retry attempts (fixed-interval policy)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            policy: RetryPolicyKind::default(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_elapsed_secs: default_max_elapsed_secs(),
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Retry policy variant selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicyKind {
    #[default]
    ExponentialBackoff,
    FixedInterval,
    NoRetry,
}

fn default_min_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_elapsed_secs() -> u64 {
    240
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load configuration from TOML content
    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;
        if let Some(module_id) = &self.device.module_id {
            validate_device_id(module_id)?;
        }

        if self.hub.hostname.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "hub.hostname must not be empty".to_string(),
            ));
        }
        if self.hub.hostname.contains("://") {
            return Err(ConfigError::InvalidConfig(
                "hub.hostname must not include a scheme".to_string(),
            ));
        }

        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(
                "retry.min_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        if self.retry.policy == RetryPolicyKind::FixedInterval && self.retry.max_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_retries must be greater than 0 for fixed-interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the SAS token from the configured environment variable
    pub fn sas_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.hub.sas_token_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Build the retry policy described by the `[retry]` section
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry.policy {
            RetryPolicyKind::NoRetry => RetryPolicy::NoRetry,
            RetryPolicyKind::FixedInterval => RetryPolicy::FixedInterval {
                interval: Duration::from_millis(self.retry.interval_ms),
                max_retries: self.retry.max_retries,
            },
            RetryPolicyKind::ExponentialBackoff => RetryPolicy::ExponentialBackoffWithJitter {
                min_backoff: Duration::from_millis(self.retry.min_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                max_elapsed: Duration::from_secs(self.retry.max_elapsed_secs),
            },
        }
    }

    /// Keep-alive interval as a Duration
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.transport.keep_alive_secs)
    }

    /// Per-operation timeout as a Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.operation_timeout_secs)
    }
}

/// Validate a device or module identifier
fn validate_device_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return Err(ConfigError::InvalidDeviceId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[device]
id = "test-device-01"

[hub]
hostname = "hub.example.net"
"#
    }

    #[test]
    fn test_load_minimal_config() {
        let config = DeviceConfig::load_from_str(minimal_toml()).unwrap();
        assert_eq!(config.device.id, "test-device-01");
        assert_eq!(config.hub.hostname, "hub.example.net");
        assert_eq!(config.transport.kind, TransportKind::MqttTcp);
        assert_eq!(config.transport.keep_alive_secs, 60);
        assert_eq!(config.retry.policy, RetryPolicyKind::ExponentialBackoff);
    }

    #[test]
    fn test_load_full_config() {
        let toml = r#"
[device]
id = "dev1"
module_id = "sensor"

[hub]
hostname = "hub.example.net"
port = 443
sas_token_env = "HUBLINK_SAS_TOKEN"

[transport]
kind = "amqp-websocket"
keep_alive_secs = 30
operation_timeout_secs = 10

[retry]
policy = "fixed-interval"
interval_ms = 250
max_retries = 3
"#;
        let config = DeviceConfig::load_from_str(toml).unwrap();
        assert_eq!(config.transport.kind, TransportKind::AmqpWebSocket);
        assert_eq!(config.hub.port, Some(443));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::FixedInterval {
                interval: Duration::from_millis(250),
                max_retries: 3,
            }
        );
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let toml = r#"
[device]
id = "bad id with spaces"

[hub]
hostname = "hub.example.net"
"#;
        let result = DeviceConfig::load_from_str(toml);
        assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
    }

    #[test]
    fn test_hostname_with_scheme_rejected() {
        let toml = r#"
[device]
id = "dev1"

[hub]
hostname = "https://hub.example.net"
"#;
        let result = DeviceConfig::load_from_str(toml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let toml = r#"
[device]
id = "dev1"

[hub]
hostname = "hub.example.net"

[retry]
min_backoff_ms = 5000
max_backoff_ms = 100
"#;
        let result = DeviceConfig::load_from_str(toml);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_sas_token_env_missing() {
        let toml = r#"
[device]
id = "dev1"

[hub]
hostname = "hub.example.net"
sas_token_env = "HUBLINK_TEST_DEFINITELY_UNSET"
"#;
        let config = DeviceConfig::load_from_str(toml).unwrap();
        assert!(matches!(
            config.sas_token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_default_retry_policy_is_exponential() {
        let config = DeviceConfig::load_from_str(minimal_toml()).unwrap();
        assert!(matches!(
            config.retry_policy(),
            RetryPolicy::ExponentialBackoffWithJitter { .. }
        ));
    }
}
