//! Management pseudo-device: host description and device inventory

use crate::commands::{CommandEntry, CommandTable};
use crate::device::DeviceIdentity;
use crate::driver::{CommandContext, DeviceDriver};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::{AlpacaDeviceType, ALPACA_API_VERSION};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const COMPONENT: &str = "Management";

/// Nothing to poll; tick rarely
pub const MANAGEMENT_TICK: Duration = Duration::from_secs(5);

pub mod cmd {
    use crate::commands::CommandCode;

    pub const API_VERSIONS: CommandCode = 1000;
    pub const DESCRIPTION: CommandCode = 1001;
    pub const CONFIGURED_DEVICES: CommandCode = 1002;
    pub const CPU_STATS: CommandCode = 1003;
    pub const LIBRARIES: CommandCode = 1004;
    pub const READ_ALL: CommandCode = 1005;
}

// `description` shadows the common command of the same name.
pub static MANAGEMENT_COMMANDS: &[CommandEntry] = &[
    CommandEntry::get("apiversions", cmd::API_VERSIONS),
    CommandEntry::get("description", cmd::DESCRIPTION),
    CommandEntry::get("configureddevices", cmd::CONFIGURED_DEVICES),
    CommandEntry::get("cpustats", cmd::CPU_STATS),
    CommandEntry::get("libraries", cmd::LIBRARIES),
    CommandEntry::get("readall", cmd::READ_ALL),
];

#[derive(Debug, Default)]
pub struct ManagementDriver;

impl ManagementDriver {
    pub fn new() -> Self {
        Self
    }
}

/// First line of a file that starts with `key`, value after the colon
fn proc_field(path: &str, key: &str) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
}

fn os_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Best-effort host facts; missing sources read as empty
pub fn cpu_stats(started: Instant) -> serde_json::Map<String, Value> {
    let uptime = started.elapsed().as_secs();
    let mut map = serde_json::Map::new();
    map.insert("platform".into(), Value::from(std::env::consts::ARCH));
    map.insert(
        "cpuinfo".into(),
        Value::from(proc_field("/proc/cpuinfo", "model name").unwrap_or_default()),
    );
    map.insert("operatingsystem".into(), Value::from(std::env::consts::OS));
    map.insert("version".into(), Value::from(os_release()));
    map.insert(
        "cpucount".into(),
        Value::from(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
    );
    map.insert("uptime_secs".into(), Value::from(uptime));
    map.insert("uptime_days".into(), Value::from(uptime as f64 / 86_400.0));
    map
}

impl DeviceDriver for ManagementDriver {
    fn device_type(&self) -> AlpacaDeviceType {
        AlpacaDeviceType::Management
    }

    fn command_table(&self) -> CommandTable {
        MANAGEMENT_COMMANDS
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: "Management".to_string(),
            description: "Alpaca management interface".to_string(),
            manufacturer: "alpaca_host".to_string(),
            model: "Management".to_string(),
            driver_info: "Host management interface".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: ALPACA_API_VERSION as i32,
            ..Default::default()
        }
    }

    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        let server = ctx.server;
        match entry.code {
            cmd::API_VERSIONS => ctx.response.value(json!([ALPACA_API_VERSION])),
            cmd::DESCRIPTION => ctx.response.value(json!({
                "ServerName": server.server_name,
                "Manufacturer": server.manufacturer,
                "ManufacturerVersion": server.manufacturer_version,
                "Location": server.location,
            })),
            cmd::CONFIGURED_DEVICES => {
                let devices = serde_json::to_value(ctx.registry.remote_summaries())
                    .map_err(|e| AlpacaError::internal(COMPONENT, e))?;
                ctx.response.value(devices);
            }
            cmd::CPU_STATS => {
                for (key, value) in cpu_stats(server.started) {
                    ctx.response.field(&key, value);
                }
                ctx.response.field("TotalCmdsProcessed", ctx.totals.commands);
                ctx.response.field("TotalErrors", ctx.totals.errors);
            }
            cmd::LIBRARIES => ctx.response.value(json!([
                { "Name": "alpaca_host", "Version": env!("CARGO_PKG_VERSION") },
            ])),
            cmd::READ_ALL => {
                ctx.write_common_properties();
                ctx.response.field("apiversions", json!([ALPACA_API_VERSION]));
                ctx.response.field("servername", server.server_name.as_str());
                ctx.response.field("devicecount", ctx.registry.remote_summaries().len());
                for (key, value) in cpu_stats(server.started) {
                    ctx.response.field(&key, value);
                }
            }
            _ => {
                return Err(AlpacaError::new(
                    AscomStatus::InvalidOperation,
                    COMPONENT,
                    format!("Unrecognized command '{}'", entry.name),
                ))
            }
        }
        Ok(())
    }

    fn tick(&mut self, _now: Instant) -> Duration {
        MANAGEMENT_TICK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::run_command_with;
    use crate::registry::{RegisterOptions, Registry};
    use crate::request::AlpacaRequest;
    use crate::FocuserDriver;

    #[test]
    fn test_configured_devices_lists_remote_devices() {
        let registry = Registry::new();
        registry.register(Box::new(ManagementDriver::new()), RegisterOptions::connected()).unwrap();
        registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::connected()).unwrap();

        let mut driver = ManagementDriver::new();
        let request = AlpacaRequest::get("management", 0, "configureddevices");
        let (result, out) = run_command_with(&mut driver, &request, true, &registry);
        assert!(result.is_ok());
        let devices = out.get("Value").and_then(Value::as_array).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["DeviceType"], "Focuser");
        assert_eq!(devices[0]["DeviceNumber"], 0);
        assert!(devices[0]["UniqueID"].as_str().unwrap().starts_with("414C5041-"));
    }

    #[test]
    fn test_api_versions_and_description() {
        let mut driver = ManagementDriver::new();
        let registry = Registry::new();
        let (_, out) = run_command_with(&mut driver, &AlpacaRequest::get("management", 0, "apiversions"), true, &registry);
        assert_eq!(out.get("Value"), Some(&json!([1])));

        let (_, out) = run_command_with(&mut driver, &AlpacaRequest::get("management", 0, "description"), true, &registry);
        let value = out.get("Value").unwrap();
        assert_eq!(value["ServerName"], "Alpaca Device Host");
        assert!(value.get("ManufacturerVersion").is_some());
    }

    #[test]
    fn test_cpu_stats_fields() {
        let mut driver = ManagementDriver::new();
        let registry = Registry::new();
        let (result, out) = run_command_with(&mut driver, &AlpacaRequest::get("management", 0, "cpustats"), true, &registry);
        assert!(result.is_ok());
        for key in ["platform", "operatingsystem", "uptime_secs", "TotalCmdsProcessed", "TotalErrors"] {
            assert!(out.get(key).is_some(), "missing {}", key);
        }
    }
}
