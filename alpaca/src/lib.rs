//! Alpaca Device Host
//!
//! Serves observatory hardware over the ASCOM Alpaca REST protocol.
//! Devices register with a [`Registry`], requests are routed through the
//! [`Dispatcher`] against static command tables, a cooperative
//! [`Scheduler`] ticks every device, and a UDP [`DiscoveryResponder`]
//! answers broadcast queries. A small reqwest client talks to remote hosts.

mod client;
mod commands;
mod config;
mod device;
mod diagnostics;
mod discovery;
mod dispatcher;
mod driver;
mod registry;
mod request;
mod scheduler;
mod stats;
mod status;
mod watchdog;

pub mod focuser;
pub mod management;
pub mod observingconditions;
pub mod rotator;
pub mod telescope;

pub use client::*;
pub use commands::*;
pub use config::*;
pub use device::*;
pub use diagnostics::*;
pub use discovery::*;
pub use dispatcher::*;
pub use driver::*;
pub use registry::*;
pub use request::*;
pub use scheduler::*;
pub use stats::*;
pub use status::*;
pub use watchdog::*;

pub use focuser::{FocuserDriver, FocuserHardware, SimulatedFocuser};
pub use management::ManagementDriver;
pub use observingconditions::{EnvironmentSensor, ObservingConditionsDriver, SimulatedWeather};
pub use rotator::{RotatorDriver, RotatorHardware, SimulatedRotator};
pub use telescope::{MountHardware, SimulatedMount, TelescopeDriver};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Alpaca API version
pub const ALPACA_API_VERSION: u32 = 1;

/// Default Alpaca discovery port
pub const ALPACA_DISCOVERY_PORT: u16 = 32227;

/// Default HTTP port of this host
pub const ALPACA_DEFAULT_PORT: u16 = 6800;

/// Alpaca device types
///
/// Serializes with the ASCOM interface names (`"Focuser"`,
/// `"ObservingConditions"`); parses any casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpacaDeviceType {
    Camera,
    CoverCalibrator,
    Dome,
    FilterWheel,
    Focuser,
    Management,
    ObservingConditions,
    Rotator,
    SafetyMonitor,
    Switch,
    Telescope,
}

impl AlpacaDeviceType {
    pub const ALL: [AlpacaDeviceType; 11] = [
        AlpacaDeviceType::Camera,
        AlpacaDeviceType::CoverCalibrator,
        AlpacaDeviceType::Dome,
        AlpacaDeviceType::FilterWheel,
        AlpacaDeviceType::Focuser,
        AlpacaDeviceType::Management,
        AlpacaDeviceType::ObservingConditions,
        AlpacaDeviceType::Rotator,
        AlpacaDeviceType::SafetyMonitor,
        AlpacaDeviceType::Switch,
        AlpacaDeviceType::Telescope,
    ];

    /// Lower-case form used in URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "camera",
            AlpacaDeviceType::CoverCalibrator => "covercalibrator",
            AlpacaDeviceType::Dome => "dome",
            AlpacaDeviceType::FilterWheel => "filterwheel",
            AlpacaDeviceType::Focuser => "focuser",
            AlpacaDeviceType::Management => "management",
            AlpacaDeviceType::ObservingConditions => "observingconditions",
            AlpacaDeviceType::Rotator => "rotator",
            AlpacaDeviceType::SafetyMonitor => "safetymonitor",
            AlpacaDeviceType::Switch => "switch",
            AlpacaDeviceType::Telescope => "telescope",
        }
    }

    /// ASCOM interface name, as used in JSON payloads
    pub fn ascom_name(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "Camera",
            AlpacaDeviceType::CoverCalibrator => "CoverCalibrator",
            AlpacaDeviceType::Dome => "Dome",
            AlpacaDeviceType::FilterWheel => "FilterWheel",
            AlpacaDeviceType::Focuser => "Focuser",
            AlpacaDeviceType::Management => "Management",
            AlpacaDeviceType::ObservingConditions => "ObservingConditions",
            AlpacaDeviceType::Rotator => "Rotator",
            AlpacaDeviceType::SafetyMonitor => "SafetyMonitor",
            AlpacaDeviceType::Switch => "Switch",
            AlpacaDeviceType::Telescope => "Telescope",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
    }

    /// Get a display name for the device type
    pub fn display_name(&self) -> &'static str {
        match self {
            AlpacaDeviceType::Camera => "Camera",
            AlpacaDeviceType::CoverCalibrator => "Cover Calibrator",
            AlpacaDeviceType::Dome => "Dome",
            AlpacaDeviceType::FilterWheel => "Filter Wheel",
            AlpacaDeviceType::Focuser => "Focuser",
            AlpacaDeviceType::Management => "Management",
            AlpacaDeviceType::ObservingConditions => "Observing Conditions",
            AlpacaDeviceType::Rotator => "Rotator",
            AlpacaDeviceType::SafetyMonitor => "Safety Monitor",
            AlpacaDeviceType::Switch => "Switch",
            AlpacaDeviceType::Telescope => "Telescope",
        }
    }
}

impl std::fmt::Display for AlpacaDeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Serialize for AlpacaDeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.ascom_name())
    }
}

impl<'de> Deserialize<'de> for AlpacaDeviceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AlpacaDeviceType::from_str(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown device type '{}'", raw)))
    }
}

/// An Alpaca device discovered on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlpacaDevice {
    pub device_type: AlpacaDeviceType,
    pub device_number: u32,
    pub server_name: String,
    pub device_name: String,
    pub unique_id: String,
    pub base_url: String,
}

impl AlpacaDevice {
    /// Get a unique identifier for this device
    pub fn id(&self) -> String {
        format!("alpaca:{}:{}:{}", self.base_url, self.device_type.as_str(), self.device_number)
    }

    /// Get a display name combining device name and type
    pub fn display_name(&self) -> String {
        if self.device_name.is_empty() {
            format!("{} #{}", self.device_type.display_name(), self.device_number)
        } else {
            self.device_name.clone()
        }
    }

    /// Client bound to this device
    pub fn client(&self) -> Result<AlpacaClient, ClientError> {
        AlpacaClient::new(self.base_url.as_str(), self.device_type, self.device_number)
    }
}

impl std::fmt::Display for AlpacaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.display_name(), self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_names() {
        for kind in AlpacaDeviceType::ALL {
            assert_eq!(AlpacaDeviceType::from_str(kind.as_str()), Some(kind));
            assert_eq!(AlpacaDeviceType::from_str(&kind.as_str().to_uppercase()), Some(kind));
            assert_eq!(AlpacaDeviceType::from_str(kind.ascom_name()), Some(kind));
        }
        assert_eq!(AlpacaDeviceType::from_str("toaster"), None);
    }

    #[test]
    fn test_device_type_serde_uses_ascom_names() {
        let json = serde_json::to_string(&AlpacaDeviceType::ObservingConditions).unwrap();
        assert_eq!(json, "\"ObservingConditions\"");
        let parsed: AlpacaDeviceType = serde_json::from_str("\"observingconditions\"").unwrap();
        assert_eq!(parsed, AlpacaDeviceType::ObservingConditions);
        assert!(serde_json::from_str::<AlpacaDeviceType>("\"toaster\"").is_err());
    }

    #[test]
    fn test_discovered_device_naming() {
        let device = AlpacaDevice {
            device_type: AlpacaDeviceType::Focuser,
            device_number: 2,
            server_name: "127.0.0.1".into(),
            device_name: String::new(),
            unique_id: String::new(),
            base_url: "http://127.0.0.1:6800".into(),
        };
        assert_eq!(device.display_name(), "Focuser #2");
        assert_eq!(device.id(), "alpaca:http://127.0.0.1:6800:focuser:2");
    }
}
