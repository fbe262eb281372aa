//! Device records: identity, connection state and usage counters

use crate::commands::COMMON_COMMANDS;
use crate::driver::DeviceDriver;
use crate::stats::DeviceStats;
use crate::AlpacaDeviceType;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Vendor code placed in the first unique-id field ("ALPA")
pub const UNIQUE_ID_VENDOR: u32 = u32::from_be_bytes(*b"ALPA");

/// Software build number placed in the second unique-id field
pub const BUILD_NUMBER: u32 = 135;

/// Samples kept by the temperature log
pub const TEMPERATURE_LOG_CAPACITY: usize = 240;

/// Minimum spacing between logged temperature samples
pub const TEMPERATURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// 128-bit locally defined identifier made of five 32-bit parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId {
    pub vendor: u32,
    pub version: u32,
    pub model: u32,
    pub reserved: u32,
    pub serial: u32,
}

impl UniqueId {
    pub fn new(model: u32, reserved: u32, serial: u32) -> Self {
        Self {
            vendor: UNIQUE_ID_VENDOR,
            version: BUILD_NUMBER,
            model,
            reserved,
            serial,
        }
    }

    /// Fresh id with a random serial number
    pub fn generate(reserved: u32) -> Self {
        Self::new(1, reserved, rand::random())
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            self.vendor, self.version, self.model, self.reserved, self.serial
        )
    }
}

impl Serialize for UniqueId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Human-readable strings describing one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceIdentity {
    pub name: String,
    pub description: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub driver_info: String,
    pub driver_version: String,
    pub interface_version: i32,
}

/// Immutable facts about a registered device, readable without its lock
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceSummary {
    #[serde(skip)]
    pub index: usize,
    pub device_type: AlpacaDeviceType,
    pub device_number: u32,
    #[serde(rename = "DeviceName")]
    pub name: String,
    #[serde(rename = "UniqueID")]
    pub unique_id: UniqueId,
}

/// One timestamped temperature reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemperatureSample {
    pub unix_secs: u64,
    pub degrees_c: f64,
}

/// Bounded history of temperatures reported during ticks
#[derive(Debug, Clone, Default)]
pub struct TemperatureLog {
    samples: VecDeque<TemperatureSample>,
    last_recorded: Option<Instant>,
}

impl TemperatureLog {
    /// Push unless a sample was taken less than `interval` before `now`.
    pub fn record(&mut self, degrees_c: f64, now: Instant, interval: Duration) -> bool {
        if let Some(last) = self.last_recorded {
            if now.saturating_duration_since(last) < interval {
                return false;
            }
        }
        self.last_recorded = Some(now);
        self.push(degrees_c);
        true
    }

    pub fn push(&mut self, degrees_c: f64) {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if self.samples.len() == TEMPERATURE_LOG_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(TemperatureSample { unix_secs, degrees_c });
    }

    pub fn samples(&self) -> impl Iterator<Item = &TemperatureSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The live, lock-guarded part of a registered device
pub struct DeviceRecord {
    pub summary: DeviceSummary,
    pub identity: DeviceIdentity,
    pub connected: bool,
    pub stats: DeviceStats,
    pub temperature_log: TemperatureLog,
    pub last_valid_command: Instant,
    pub driver: Box<dyn DeviceDriver>,
}

impl DeviceRecord {
    pub fn new(summary: DeviceSummary, identity: DeviceIdentity, driver: Box<dyn DeviceDriver>) -> Self {
        let stats = DeviceStats::new(COMMON_COMMANDS, driver.command_table());
        Self {
            summary,
            identity,
            connected: false,
            stats,
            temperature_log: TemperatureLog::default(),
            last_valid_command: Instant::now(),
            driver,
        }
    }

    pub fn device_type(&self) -> AlpacaDeviceType {
        self.summary.device_type
    }

    pub fn device_number(&self) -> u32 {
        self.summary.device_number
    }

    /// Short tag used as the component in error messages
    pub fn component(&self) -> &'static str {
        self.summary.device_type.display_name()
    }
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("summary", &self.summary)
            .field("connected", &self.connected)
            .field("total_commands", &self.stats.total_commands)
            .finish_non_exhaustive()
    }
}
