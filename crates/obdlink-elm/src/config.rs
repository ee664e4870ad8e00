//! Configuration for the diagnostic core
//!
//! Transport, protocol session, polling, and reconnection settings.
//! Static reference tables (PIDs, DTC descriptions, manufacturer
//! command maps) and security parameters are not configuration of this
//! crate; they come from the injected `ProfileProvider`.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the diagnostic core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticConfig {
    /// Transport selection and settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Protocol session behavior
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Live-data polling defaults
    #[serde(default)]
    pub polling: PollingConfig,
}

impl DiagnosticConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "protocol.command_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling.interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Bluetooth RFCOMM via BlueZ (Linux only)
    Bluetooth(BluetoothConfig),
    /// Mock transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// Bluetooth RFCOMM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Local adapter name (e.g. "hci0"); default adapter when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    /// RFCOMM channel on the remote device
    #[serde(default = "default_rfcomm_channel")]
    pub channel: u8,
    /// Scan duration in seconds
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            channel: default_rfcomm_channel(),
            scan_secs: default_scan_secs(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_rfcomm_channel() -> u8 {
    1
}

fn default_scan_secs() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    15000
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated response latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Protocol Session Configuration
// =============================================================================

/// Protocol session behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Default per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Idle read timeout while accumulating a response, in milliseconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Retry count for idempotent commands that time out
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            max_retries: default_retries(),
        }
    }
}

fn default_command_timeout() -> u64 {
    3000
}

fn default_idle_timeout() -> u64 {
    200
}

fn default_retries() -> u32 {
    2
}

// =============================================================================
// Reconnection Configuration
// =============================================================================

/// Bounded exponential-backoff reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum reconnect attempts after an unexpected drop
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds; doubles per attempt
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            initial_backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    8000
}

// =============================================================================
// Polling Configuration
// =============================================================================

/// Live-data polling defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DiagnosticConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [transport]
            type = "mock"
            latency_ms = 5

            [protocol]
            command_timeout_ms = 2000

            [reconnect]
            max_attempts = 5
        "#;
        let config = DiagnosticConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.protocol.command_timeout_ms, 2000);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(matches!(
            config.transport,
            TransportConfig::Mock(MockConfig { latency_ms: 5 })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml = r#"
            [protocol]
            command_timeout_ms = 0
        "#;
        assert!(DiagnosticConfig::from_toml_str(toml).is_err());
    }
}
