//! Command tables
//!
//! Each device type publishes a static, ordered table that maps a command
//! name to an operation code and the verbs it accepts. Codes below
//! [`DEVICE_CODE_BASE`] belong to the common table shared by every device.

use serde::Serialize;

pub type CommandCode = u16;

/// First operation code available to device-specific tables
pub const DEVICE_CODE_BASE: CommandCode = 1000;

/// HTTP verb of an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verb {
    Get,
    Put,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbs a table entry accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllowedVerb {
    Get,
    Put,
    Both,
}

impl AllowedVerb {
    pub fn allows(&self, verb: Verb) -> bool {
        matches!(
            (self, verb),
            (AllowedVerb::Both, _) | (AllowedVerb::Get, Verb::Get) | (AllowedVerb::Put, Verb::Put)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub name: &'static str,
    pub code: CommandCode,
    pub verb: AllowedVerb,
}

impl CommandEntry {
    pub const fn get(name: &'static str, code: CommandCode) -> Self {
        Self { name, code, verb: AllowedVerb::Get }
    }

    pub const fn put(name: &'static str, code: CommandCode) -> Self {
        Self { name, code, verb: AllowedVerb::Put }
    }

    pub const fn both(name: &'static str, code: CommandCode) -> Self {
        Self { name, code, verb: AllowedVerb::Both }
    }

    /// Entries starting with `-` are separators and never advertised
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('-')
    }
}

/// An ordered command table; the end of the slice terminates the scan.
pub type CommandTable = &'static [CommandEntry];

/// Case-insensitive exact lookup.
pub fn resolve(name: &str, table: CommandTable) -> Option<&'static CommandEntry> {
    if name.is_empty() {
        return None;
    }
    table.iter().find(|entry| entry.name.eq_ignore_ascii_case(name))
}

/// Where a resolved command lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Device(&'static CommandEntry),
    Common(&'static CommandEntry),
}

impl Resolved {
    pub fn entry(&self) -> &'static CommandEntry {
        match self {
            Resolved::Device(entry) | Resolved::Common(entry) => entry,
        }
    }
}

/// Device table first, common table second.
pub fn resolve_for_device(name: &str, device_table: CommandTable) -> Option<Resolved> {
    resolve(name, device_table)
        .map(Resolved::Device)
        .or_else(|| resolve(name, COMMON_COMMANDS).map(Resolved::Common))
}

/// Names a client may see for a device: common table then device table.
///
/// Common entries shadowed by the device table are listed once, in the
/// device section.
pub fn advertised_names(device_table: CommandTable) -> Vec<&'static str> {
    COMMON_COMMANDS
        .iter()
        .filter(|entry| resolve(entry.name, device_table).is_none())
        .chain(device_table.iter())
        .filter(|entry| !entry.is_hidden())
        .map(|entry| entry.name)
        .collect()
}

/// Operation codes of the shared command set
pub mod common {
    use super::CommandCode;

    pub const ACTION: CommandCode = 0;
    pub const COMMAND_BLIND: CommandCode = 1;
    pub const COMMAND_BOOL: CommandCode = 2;
    pub const COMMAND_STRING: CommandCode = 3;
    pub const CONNECTED: CommandCode = 4;
    pub const CONNECT: CommandCode = 5;
    pub const CONNECTING: CommandCode = 6;
    pub const DISCONNECT: CommandCode = 7;
    pub const DEVICE_STATE: CommandCode = 8;
    pub const DESCRIPTION: CommandCode = 9;
    pub const DRIVER_INFO: CommandCode = 10;
    pub const DRIVER_VERSION: CommandCode = 11;
    pub const INTERFACE_VERSION: CommandCode = 12;
    pub const NAME: CommandCode = 13;
    pub const SUPPORTED_ACTIONS: CommandCode = 14;
    pub const EXTRAS: CommandCode = 15;
    pub const TEMPERATURE_LOG: CommandCode = 16;
}

pub static COMMON_COMMANDS: &[CommandEntry] = &[
    CommandEntry::put("action", common::ACTION),
    CommandEntry::put("commandblind", common::COMMAND_BLIND),
    CommandEntry::put("commandbool", common::COMMAND_BOOL),
    CommandEntry::put("commandstring", common::COMMAND_STRING),
    CommandEntry::both("connected", common::CONNECTED),
    CommandEntry::put("connect", common::CONNECT),
    CommandEntry::get("connecting", common::CONNECTING),
    CommandEntry::put("disconnect", common::DISCONNECT),
    CommandEntry::get("devicestate", common::DEVICE_STATE),
    CommandEntry::get("description", common::DESCRIPTION),
    CommandEntry::get("driverinfo", common::DRIVER_INFO),
    CommandEntry::get("driverversion", common::DRIVER_VERSION),
    CommandEntry::get("interfaceversion", common::INTERFACE_VERSION),
    CommandEntry::get("name", common::NAME),
    CommandEntry::get("supportedactions", common::SUPPORTED_ACTIONS),
    CommandEntry::get("--extras", common::EXTRAS),
    CommandEntry::get("temperaturelog", common::TEMPERATURE_LOG),
];
