//! Host configuration loading and validation

use crate::driver::DeviceDriver;
use crate::registry::{RegisterOptions, Registry, RegistryError};
use crate::scheduler::SchedulerConfig;
use crate::watchdog::WatchdogConfig;
use crate::{
    AlpacaDeviceType, FocuserDriver, ManagementDriver, ObservingConditionsDriver, RotatorDriver, TelescopeDriver,
    ALPACA_DEFAULT_PORT, ALPACA_DISCOVERY_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("device entry {index}: {reason}")]
    InvalidDevice { index: usize, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default = "default_devices", rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            discovery: DiscoverySection::default(),
            scheduler: SchedulerSection::default(),
            watchdog: WatchdogSection::default(),
            devices: default_devices(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Bind address for the HTTP server
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_location")]
    pub location: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            location: default_location(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    ALPACA_DEFAULT_PORT
}

fn default_location() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_discovery_port(),
        }
    }
}

fn default_discovery_port() -> u16 {
    ALPACA_DISCOVERY_PORT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Delay used when a device asks for none
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,
    #[serde(default = "default_min_delay_us")]
    pub min_delay_us: u64,
    /// Bound on waiting for a busy device
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_delay_ms: default_delay_ms(),
            min_delay_us: default_min_delay_us(),
            tick_timeout_ms: default_tick_timeout_ms(),
        }
    }
}

impl SchedulerSection {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_delay: Duration::from_millis(self.default_delay_ms.max(1)),
            min_delay: Duration::from_micros(self.min_delay_us),
            tick_timeout: Duration::from_millis(self.tick_timeout_ms),
        }
    }
}

fn default_delay_ms() -> u64 {
    500
}

fn default_min_delay_us() -> u64 {
    50
}

fn default_tick_timeout_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_minutes: default_timeout_minutes(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl WatchdogSection {
    pub fn to_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            enabled: self.enabled,
            timeout: Duration::from_secs(self.timeout_minutes * 60),
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
        }
    }
}

fn default_timeout_minutes() -> u64 {
    5
}

fn default_check_interval_secs() -> u64 {
    60
}

/// One `[[device]]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "type")]
    pub device_type: AlpacaDeviceType,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_true")]
    pub connect_on_start: bool,
}

impl DeviceEntry {
    pub fn simulator(device_type: AlpacaDeviceType) -> Self {
        Self {
            device_type,
            driver: default_driver(),
            name: None,
            serial: None,
            connect_on_start: true,
        }
    }

    /// Instantiate the driver this entry names
    pub fn build_driver(&self, index: usize) -> Result<Box<dyn DeviceDriver>, ConfigError> {
        if !self.driver.eq_ignore_ascii_case("simulator") {
            return Err(ConfigError::InvalidDevice {
                index,
                reason: format!("unknown driver '{}'", self.driver),
            });
        }
        match self.device_type {
            AlpacaDeviceType::Focuser => Ok(Box::new(FocuserDriver::simulator())),
            AlpacaDeviceType::Rotator => Ok(Box::new(RotatorDriver::simulator())),
            AlpacaDeviceType::ObservingConditions => Ok(Box::new(ObservingConditionsDriver::simulator())),
            AlpacaDeviceType::Telescope => Ok(Box::new(TelescopeDriver::simulator())),
            other => Err(ConfigError::InvalidDevice {
                index,
                reason: format!("device type '{}' is not supported", other.as_str()),
            }),
        }
    }

    pub fn register_options(&self) -> RegisterOptions {
        RegisterOptions {
            name: self.name.clone(),
            serial_number: self.serial.clone(),
            connected: self.connect_on_start,
        }
    }
}

fn default_driver() -> String {
    "simulator".to_string()
}

fn default_devices() -> Vec<DeviceEntry> {
    vec![
        DeviceEntry::simulator(AlpacaDeviceType::Focuser),
        DeviceEntry::simulator(AlpacaDeviceType::Rotator),
        DeviceEntry::simulator(AlpacaDeviceType::ObservingConditions),
    ]
}

impl HostConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject entries that cannot be built before anything is registered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, entry) in self.devices.iter().enumerate() {
            entry.build_driver(index)?;
        }
        Ok(())
    }

    /// Registry holding the management device followed by every configured device
    pub fn build_registry(&self) -> Result<Registry, ConfigError> {
        let registry = Registry::new();
        registry.register(Box::new(ManagementDriver::new()), RegisterOptions::connected())?;
        for (index, entry) in self.devices.iter().enumerate() {
            let driver = entry.build_driver(index)?;
            registry.register(driver, entry.register_options())?;
        }
        Ok(registry)
    }
}

/// Load configuration from `path`, or defaults when the file does not exist
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = HostConfig::from_toml(&content)?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(HostConfig::default())
    }
}
