//! The two-operation contract every device variant implements

use crate::commands::{CommandEntry, CommandTable};
use crate::device::DeviceIdentity;
use crate::registry::Registry;
use crate::request::{AlpacaRequest, ResponseFields};
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use crate::AlpacaDeviceType;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Host-wide facts a handler may report (management device)
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_name: String,
    pub manufacturer: String,
    pub manufacturer_version: String,
    pub location: String,
    pub started: Instant,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_name: "Alpaca Device Host".to_string(),
            manufacturer: "alpaca_host".to_string(),
            manufacturer_version: env!("CARGO_PKG_VERSION").to_string(),
            location: String::new(),
            started: Instant::now(),
        }
    }
}

/// Commands and errors counted across every device on this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostTotals {
    pub commands: u64,
    pub errors: u64,
}

/// Everything a handler can see while it runs
pub struct CommandContext<'a> {
    pub request: &'a AlpacaRequest,
    pub response: &'a mut ResponseFields,
    pub identity: &'a DeviceIdentity,
    pub connected: bool,
    pub registry: &'a Registry,
    pub server: &'a ServerInfo,
    pub totals: HostTotals,
}

impl CommandContext<'_> {
    /// Reject hardware-moving commands while disconnected
    #[track_caller]
    pub fn require_connected(&self, component: &str) -> AlpacaResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(AlpacaError::not_connected(component))
        }
    }

    /// Properties every `readall` starts with
    pub fn write_common_properties(&mut self) {
        let identity = self.identity;
        let out = &mut *self.response;
        out.field("connected", self.connected);
        out.field("description", identity.description.as_str());
        out.field("driverinfo", identity.driver_info.as_str());
        out.field("driverversion", identity.driver_version.as_str());
        out.field("interfaceversion", identity.interface_version);
        out.field("name", identity.name.as_str());
        out.field("version", env!("CARGO_PKG_VERSION"));
        out.field("Model", identity.model.as_str());
    }
}

/// A device variant: command handler plus tick function.
///
/// Hardware back ends (simulator, serial, vendor SDK) sit behind the
/// device-type drivers as strategies; the dispatcher and scheduler only
/// ever see this trait.
pub trait DeviceDriver: Send {
    fn device_type(&self) -> AlpacaDeviceType;

    /// The device-specific command table (codes >= 1000)
    fn command_table(&self) -> CommandTable;

    /// Default identity; names may be overridden at registration
    fn identity(&self) -> DeviceIdentity;

    /// Run a device-table command. Verb checks are already done.
    fn handle_command(&mut self, entry: &CommandEntry, ctx: &mut CommandContext<'_>) -> AlpacaResult<()>;

    /// One non-blocking state update; returns the wanted delay until the
    /// next one. `Duration::ZERO` asks for the scheduler default.
    fn tick(&mut self, now: Instant) -> Duration;

    /// Name/value pairs reported by `devicestate`
    fn device_state(&self) -> Vec<(&'static str, Value)> {
        Vec::new()
    }

    /// Latest temperature, recorded into the temperature log after ticks
    fn temperature(&self) -> Option<f64> {
        None
    }

    /// Whether the hardware has a temperature sensor at all, readings or not.
    /// Decides `temperaturelog` support.
    fn reports_temperature(&self) -> bool {
        false
    }

    /// Called when a client changes the connected state
    fn set_connected(&mut self, _connected: bool) -> AlpacaResult<()> {
        Ok(())
    }

    /// Device-specific `action` verbs
    fn action(&mut self, name: &str, _parameters: &str, _ctx: &mut CommandContext<'_>) -> AlpacaResult<()> {
        Err(AlpacaError::new(
            AscomStatus::ActionNotImplemented,
            self.device_type().display_name(),
            format!("action '{}' is not implemented", name),
        ))
    }

    /// No valid command arrived within the watchdog window
    fn watchdog_timeout(&mut self) {}
}
