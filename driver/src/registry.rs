//! # Device Registry
//!
//! Process-wide table of registered devices. The registry assigns every
//! device its id, hands out shared references by id, and guards orderly
//! retirement: a device that still has open handles, live views, or
//! interrupt delivery enabled cannot be retired, only force-removed.
//!
//! The table lock is held only for table operations, never across calls
//! into a device, and it nests with no other lock in the crate.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{Device, DeviceId};
use crate::error::Error;

/// Table of all registered devices.
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<DeviceId, Arc<Device>>>,
    next_id: Mutex<u64>,
}

impl DeviceRegistry {
    /// Creates an empty registry. Ids start at 1.
    pub fn new() -> Self {
        DeviceRegistry {
            devices: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Registers `device`, assigning it the next id, readable afterwards
    /// through [`Device::id`]. Returns false when the device object has
    /// ever been registered before, including one that was since removed.
    pub fn add(&self, device: Arc<Device>) -> bool {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            DeviceId(*next)
        };
        if !device.link(id) {
            return false;
        }
        log::info!("{}: registered as device {}", device.name(), id.0);
        self.devices.lock().insert(id, device);
        true
    }

    /// Retires `id` if the device is quiescent: no open handles, no live
    /// views, interrupt delivery off. Returns the removed device.
    pub fn retire(&self, id: DeviceId) -> Result<Arc<Device>, Error> {
        let mut devices = self.devices.lock();
        let device = devices.remove(&id).ok_or(Error::DeviceNotFound)?;
        if device.in_use() {
            log::warn!("{}: retire refused while in use", device.name());
            devices.insert(id, device);
            return Err(Error::Busy);
        }
        device.unlink();
        log::info!("{}: retired", device.name());
        Ok(device)
    }

    /// Removes `id` unconditionally, for devices that have vanished out
    /// from under the layer. Existing shared references stay valid.
    pub fn remove(&self, id: DeviceId) -> bool {
        let device = match self.devices.lock().remove(&id) {
            Some(device) => device,
            None => return false,
        };
        device.unlink();
        if device.in_use() {
            log::warn!("{}: removed while still in use", device.name());
        } else {
            log::info!("{}: removed", device.name());
        }
        true
    }

    /// Looks up a registered device by id.
    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.lock().get(&id).cloned()
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.devices.lock().len()
    }

    /// All registered devices, collected under the table lock.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.lock().values().cloned().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec;
    use tally_regmap::{Access, SpaceLayout};

    use crate::device::DeviceConfig;
    use crate::dispatch::IrqWiring;
    use crate::regspace::{MemoryBus, RegisterSpace, SpaceId};

    fn card(name: &str) -> Arc<Device> {
        let mut layout = SpaceLayout::new(4);
        layout.mark(0..4, Access::RW);
        let config = DeviceConfig {
            name: String::from(name),
            default_queue_capacity: 4,
            wiring: IrqWiring {
                space: SpaceId::new(0),
                offset: 0,
                mask: 1,
            },
        };
        let spaces = vec![RegisterSpace::new(
            "ctrl",
            &layout,
            Box::new(MemoryBus::new(4)),
        )];
        Arc::new(Device::new(config, spaces).expect("card fixture should construct"))
    }

    #[test]
    fn test_add_assigns_sequential_ids() {
        let registry = DeviceRegistry::new();
        let first = card("card0");
        let second = card("card1");
        assert!(registry.add(first.clone()));
        assert!(registry.add(second.clone()));
        assert_eq!(first.id(), DeviceId(1));
        assert_eq!(second.id(), DeviceId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_add_rejects_an_already_registered_device() {
        let registry = DeviceRegistry::new();
        let device = card("card0");
        assert!(registry.add(device.clone()));
        assert!(!registry.add(device.clone()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_retired_device_cannot_come_back() {
        let registry = DeviceRegistry::new();
        let device = card("card0");
        assert!(registry.add(device.clone()));
        registry.retire(device.id()).expect("should retire");
        assert!(!registry.add(device));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_retire_refused_while_in_use() {
        let registry = DeviceRegistry::new();
        let device = card("card0");
        assert!(registry.add(device.clone()));
        let id = device.id();
        let handle = device.open();
        assert_eq!(registry.retire(id).map(|_| ()), Err(Error::Busy));
        assert_eq!(registry.count(), 1);
        device.close(handle).expect("should close");
        registry.retire(id).expect("should retire once quiescent");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_retire_unknown_id() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.retire(DeviceId(9)).map(|_| ()),
            Err(Error::DeviceNotFound)
        );
    }

    #[test]
    fn test_remove_is_unconditional() {
        let registry = DeviceRegistry::new();
        let device = card("card0");
        assert!(registry.add(device.clone()));
        let id = device.id();
        let _handle = device.open();
        assert!(registry.remove(id));
        assert_eq!(registry.count(), 0);
        assert!(registry.get(id).is_none());
        assert!(!registry.remove(id));
    }

    #[test]
    fn test_get_and_snapshot_share_the_device() {
        let registry = DeviceRegistry::new();
        let device = card("card0");
        assert!(registry.add(device.clone()));
        let fetched = registry.get(device.id()).expect("should resolve the id");
        assert!(Arc::ptr_eq(&fetched, &device));
        let all = registry.snapshot();
        assert_eq!(all.len(), 1);
        assert!(Arc::ptr_eq(&all[0], &device));
    }
}
