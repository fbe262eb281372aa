//! Process-wide device registry

use crate::device::{DeviceIdentity, DeviceRecord, DeviceSummary, UniqueId};
use crate::driver::DeviceDriver;
use crate::AlpacaDeviceType;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Upper bound on registered devices
pub const MAX_DEVICES: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device registry is full ({capacity} devices)")]
    Full { capacity: usize },
}

/// A registered device: immutable summary plus its lock-guarded record
#[derive(Debug)]
pub struct DeviceSlot {
    pub summary: DeviceSummary,
    record: Mutex<DeviceRecord>,
}

impl DeviceSlot {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, DeviceRecord> {
        self.record.lock().await
    }

    pub fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, DeviceRecord>> {
        self.record.try_lock().ok()
    }
}

pub type DeviceHandle = Arc<DeviceSlot>;

/// Optional overrides applied when a device is registered
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub name: Option<String>,
    pub serial_number: Option<String>,
    pub connected: bool,
}

impl RegisterOptions {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }
}

/// Append-only device list.
///
/// Indices are global and never reused; device numbers count up from
/// zero within each device type in registration order.
#[derive(Debug)]
pub struct Registry {
    devices: RwLock<Vec<DeviceHandle>>,
    capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(MAX_DEVICES)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a device and return its per-type device number.
    pub fn register(
        &self,
        driver: Box<dyn DeviceDriver>,
        options: RegisterOptions,
    ) -> Result<u32, RegistryError> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.len() >= self.capacity {
            return Err(RegistryError::Full { capacity: self.capacity });
        }

        let device_type = driver.device_type();
        let device_number = devices
            .iter()
            .filter(|slot| slot.summary.device_type == device_type)
            .count() as u32;
        let index = devices.len();

        let mut identity: DeviceIdentity = driver.identity();
        if let Some(name) = options.name {
            identity.name = name;
        }
        if let Some(serial) = options.serial_number {
            identity.serial_number = serial;
        }

        let summary = DeviceSummary {
            index,
            device_type,
            device_number,
            name: identity.name.clone(),
            unique_id: UniqueId::generate(index as u32),
        };

        info!(
            device_type = device_type.as_str(),
            device_number,
            name = %summary.name,
            unique_id = %summary.unique_id,
            "Registered device"
        );

        let mut record = DeviceRecord::new(summary.clone(), identity, driver);
        record.connected = options.connected;
        devices.push(Arc::new(DeviceSlot {
            summary,
            record: Mutex::new(record),
        }));
        Ok(device_number)
    }

    /// Look a device up by type and per-type number.
    pub fn find(&self, device_type: AlpacaDeviceType, device_number: u32) -> Option<DeviceHandle> {
        self.read()
            .iter()
            .find(|slot| {
                slot.summary.device_type == device_type && slot.summary.device_number == device_number
            })
            .cloned()
    }

    /// How many devices of a type are attached
    pub fn by_type(&self, device_type: AlpacaDeviceType) -> usize {
        self.read()
            .iter()
            .filter(|slot| slot.summary.device_type == device_type)
            .count()
    }

    pub fn first(&self, device_type: AlpacaDeviceType) -> Option<DeviceHandle> {
        self.find(device_type, 0)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Handle by global registry index
    pub fn get(&self, index: usize) -> Option<DeviceHandle> {
        self.read().get(index).cloned()
    }

    pub fn all(&self) -> Vec<DeviceHandle> {
        self.read().clone()
    }

    /// Summaries of devices a remote client may address (no management device)
    pub fn remote_summaries(&self) -> Vec<DeviceSummary> {
        self.read()
            .iter()
            .filter(|slot| slot.summary.device_type != AlpacaDeviceType::Management)
            .map(|slot| slot.summary.clone())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<DeviceHandle>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FocuserDriver, ManagementDriver, RotatorDriver};

    #[test]
    fn test_same_type_devices_numbered_in_order() {
        let registry = Registry::new();
        assert_eq!(registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::default()), Ok(0));
        assert_eq!(registry.register(Box::new(RotatorDriver::simulator()), RegisterOptions::default()), Ok(0));
        assert_eq!(registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::default()), Ok(1));

        assert_eq!(registry.by_type(AlpacaDeviceType::Focuser), 2);
        assert_eq!(registry.by_type(AlpacaDeviceType::Rotator), 1);
        assert_eq!(registry.by_type(AlpacaDeviceType::Telescope), 0);
        assert_eq!(registry.count(), 3);

        let second = registry.find(AlpacaDeviceType::Focuser, 1).expect("second focuser");
        assert_eq!(second.summary.index, 2);
        assert_ne!(
            registry.first(AlpacaDeviceType::Focuser).map(|s| s.summary.unique_id),
            Some(second.summary.unique_id)
        );
        assert!(registry.find(AlpacaDeviceType::Focuser, 2).is_none());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let registry = Registry::with_capacity(1);
        registry
            .register(Box::new(FocuserDriver::simulator()), RegisterOptions::default())
            .unwrap();
        assert_eq!(
            registry.register(Box::new(FocuserDriver::simulator()), RegisterOptions::default()),
            Err(RegistryError::Full { capacity: 1 })
        );
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_register_options_override_identity() {
        let registry = Registry::new();
        let options = RegisterOptions {
            name: Some("Main focuser".to_string()),
            serial_number: Some("SN-1".to_string()),
            connected: true,
        };
        registry.register(Box::new(FocuserDriver::simulator()), options).unwrap();
        let slot = registry.first(AlpacaDeviceType::Focuser).unwrap();
        assert_eq!(slot.summary.name, "Main focuser");
        let record = slot.lock().await;
        assert!(record.connected);
        assert_eq!(record.identity.serial_number, "SN-1");
    }

    #[test]
    fn test_management_device_is_not_remote() {
        let registry = Registry::new();
        registry
            .register(Box::new(ManagementDriver::new()), RegisterOptions::connected())
            .unwrap();
        registry
            .register(Box::new(FocuserDriver::simulator()), RegisterOptions::default())
            .unwrap();
        let remote = registry.remote_summaries();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].device_type, AlpacaDeviceType::Focuser);
    }
}
