//! Per-command usage counters

use crate::commands::{CommandCode, CommandTable, Verb, DEVICE_CODE_BASE};
use serde::Serialize;

/// Counters for one operation code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CmdStats {
    pub connection: u64,
    pub get: u64,
    pub put: u64,
    pub error: u64,
}

impl CmdStats {
    pub fn record(&mut self, verb: Verb, failed: bool) {
        self.connection += 1;
        match verb {
            Verb::Get => self.get += 1,
            Verb::Put => self.put += 1,
        }
        if failed {
            self.error += 1;
        }
    }
}

/// Fixed-size table indexed by `code - base`
#[derive(Debug, Clone)]
pub struct StatsTable {
    base: CommandCode,
    rows: Vec<CmdStats>,
}

impl StatsTable {
    /// Sized to hold every code that appears in `table`.
    pub fn for_table(table: CommandTable, base: CommandCode) -> Self {
        let len = table
            .iter()
            .map(|entry| usize::from(entry.code.saturating_sub(base)) + 1)
            .max()
            .unwrap_or(0);
        Self {
            base,
            rows: vec![CmdStats::default(); len],
        }
    }

    pub fn for_device_table(table: CommandTable) -> Self {
        Self::for_table(table, DEVICE_CODE_BASE)
    }

    /// Codes outside the table are ignored.
    pub fn record(&mut self, code: CommandCode, verb: Verb, failed: bool) -> bool {
        match self.slot_mut(code) {
            Some(row) => {
                row.record(verb, failed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, code: CommandCode) -> Option<&CmdStats> {
        let index = code.checked_sub(self.base)?;
        self.rows.get(usize::from(index))
    }

    fn slot_mut(&mut self, code: CommandCode) -> Option<&mut CmdStats> {
        let index = code.checked_sub(self.base)?;
        self.rows.get_mut(usize::from(index))
    }

    pub fn total(&self) -> CmdStats {
        self.rows.iter().fold(CmdStats::default(), |mut acc, row| {
            acc.connection += row.connection;
            acc.get += row.get;
            acc.put += row.put;
            acc.error += row.error;
            acc
        })
    }
}

/// Both tables of one device plus running totals
#[derive(Debug, Clone)]
pub struct DeviceStats {
    pub common: StatsTable,
    pub device: StatsTable,
    pub total_commands: u64,
    pub total_errors: u64,
}

impl DeviceStats {
    pub fn new(common_table: CommandTable, device_table: CommandTable) -> Self {
        Self {
            common: StatsTable::for_table(common_table, 0),
            device: StatsTable::for_device_table(device_table),
            total_commands: 0,
            total_errors: 0,
        }
    }

    /// Route by code range and bump the totals.
    pub fn record(&mut self, code: CommandCode, verb: Verb, failed: bool) {
        let table = if code >= DEVICE_CODE_BASE {
            &mut self.device
        } else {
            &mut self.common
        };
        table.record(code, verb, failed);
        self.total_commands += 1;
        if failed {
            self.total_errors += 1;
        }
    }

    /// A command that matched no table still counts toward the totals.
    pub fn record_unresolved(&mut self) {
        self.total_commands += 1;
        self.total_errors += 1;
    }

    pub fn lookup(&self, code: CommandCode) -> Option<&CmdStats> {
        if code >= DEVICE_CODE_BASE {
            self.device.get(code)
        } else {
            self.common.get(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandEntry, COMMON_COMMANDS};

    static TABLE: &[CommandEntry] = &[
        CommandEntry::get("position", 1000),
        CommandEntry::put("move", 1001),
        CommandEntry::get("readall", 1004),
    ];

    #[test]
    fn test_table_sized_by_highest_code() {
        let table = StatsTable::for_device_table(TABLE);
        assert!(table.get(1004).is_some());
        assert!(table.get(1005).is_none());
        assert!(table.get(999).is_none());
    }

    #[test]
    fn test_record_counts_verbs_and_errors() {
        let mut stats = DeviceStats::new(COMMON_COMMANDS, TABLE);
        stats.record(1000, Verb::Get, false);
        stats.record(1000, Verb::Put, true);
        stats.record(4, Verb::Get, false);

        assert_eq!(
            stats.lookup(1000).copied(),
            Some(CmdStats { connection: 2, get: 1, put: 1, error: 1 })
        );
        assert_eq!(stats.lookup(4).map(|s| s.get), Some(1));
        assert_eq!(stats.total_commands, 3);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.device.total().connection, 2);
        assert_eq!(stats.common.total().connection, 1);
    }

    #[test]
    fn test_out_of_range_code_is_ignored_by_table() {
        let mut table = StatsTable::for_device_table(TABLE);
        assert!(!table.record(2000, Verb::Get, false));
        assert_eq!(table.total(), CmdStats::default());
    }
}
