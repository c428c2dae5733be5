//! Engine configuration
//!
//! Loaded from JSON by the host; every field except device ids and
//! addresses has a default.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use super::types::Device;

/// Device connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub comm_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub clear_after_sync: bool,
}

fn default_port() -> u16 {
    4370
}

fn default_timeout() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

impl From<DeviceConfig> for Device {
    fn from(config: DeviceConfig) -> Self {
        let name = if config.name.trim().is_empty() {
            config.id.clone()
        } else {
            config.name
        };
        Device {
            id: config.id,
            name,
            address: config.address,
            port: config.port,
            timeout_ms: config.timeout,
            enabled: config.enabled,
            comm_key: config.comm_key,
            clear_after_sync: config.clear_after_sync,
        }
    }
}

/// Immediate retries of a failed connect/fetch within one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Seconds between periodic cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Device cycles allowed to run at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Sync results kept in the in-memory audit trail
    #[serde(default = "default_audit_history")]
    pub audit_history: usize,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_interval() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    4
}

fn default_audit_history() -> usize {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
            audit_history: default_audit_history(),
            devices: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid("intervalSecs must be greater than 0"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("maxConcurrency must be at least 1"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_device(device)?;
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "Duplicate device id: {}",
                    device.id
                )));
            }
        }
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().cloned().map(Device::from).collect()
    }
}

/// Accepts dotted IPv4 addresses and plain host names
fn validate_address(address: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::invalid(format!("Invalid device address: {}", address));
    if address.is_empty() {
        return Err(invalid());
    }

    let parts: Vec<&str> = address.split('.').collect();
    if parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
        if parts.len() != 4 {
            return Err(invalid());
        }
        for part in &parts {
            if part.parse::<u8>().is_err() {
                return Err(invalid());
            }
        }
        return Ok(());
    }

    let valid_host = parts.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if valid_host {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn validate_port(port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::invalid("Port cannot be 0"));
    }
    Ok(())
}

pub fn validate_device(device: &DeviceConfig) -> Result<(), ConfigError> {
    if device.id.trim().is_empty() {
        return Err(ConfigError::invalid("Device id cannot be empty"));
    }
    validate_address(&device.address)?;
    validate_port(device.port)?;
    if device.timeout == 0 {
        return Err(ConfigError::invalid(format!(
            "Device {} timeout must be greater than 0",
            device.id
        )));
    }
    Ok(())
}
