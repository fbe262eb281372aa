//! Command watchdog
//!
//! A device that has not received a successful command within the timeout
//! is told so through [`DeviceDriver::watchdog_timeout`](crate::DeviceDriver::watchdog_timeout),
//! which typically halts motion.

use crate::device::DeviceRecord;
use crate::registry::Registry;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Fire the watchdog on one record if it has expired.
pub fn check_record(record: &mut DeviceRecord, now: Instant, timeout: Duration) -> bool {
    if now.saturating_duration_since(record.last_valid_command) <= timeout {
        return false;
    }
    info!(
        device_type = record.device_type().as_str(),
        device_number = record.device_number(),
        idle_secs = now.saturating_duration_since(record.last_valid_command).as_secs(),
        "Watchdog expired"
    );
    record.driver.watchdog_timeout();
    record.last_valid_command = now;
    true
}

/// Check every registered device; returns how many expired.
///
/// A device whose lock cannot be taken within `lock_timeout` is skipped
/// until the next sweep.
pub async fn sweep(registry: &Registry, now: Instant, timeout: Duration, lock_timeout: Duration) -> usize {
    let mut expired = 0;
    for handle in registry.all() {
        match tokio::time::timeout(lock_timeout, handle.lock()).await {
            Ok(mut record) => {
                if check_record(&mut record, now, timeout) {
                    expired += 1;
                }
            }
            Err(_) => warn!(
                device_type = handle.summary.device_type.as_str(),
                device_number = handle.summary.device_number,
                "Watchdog skipped busy device"
            ),
        }
    }
    expired
}
