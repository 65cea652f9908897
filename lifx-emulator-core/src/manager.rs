//! Owns the set of emulated devices. Keyed by serial, with an insertion-order index so
//! broadcasts are delivered deterministically (a plain `HashMap` makes no iteration-order
//! guarantee).

use std::collections::HashMap;

use crate::device::Device;
use crate::events::DeviceLifecycleObserver;
use crate::serial::Serial;

/// Error returned when adding a device whose serial is already registered.
#[derive(Debug, thiserror::Error)]
#[error("device with serial {0} is already registered")]
pub struct DuplicateSerial(pub Serial);

/// Holds every registered device and dispatches add/remove lifecycle callbacks.
#[derive(Default)]
pub struct DeviceManager {
    devices: HashMap<Serial, Device>,
    order: Vec<Serial>,
}

impl DeviceManager {
    pub fn new() -> DeviceManager {
        DeviceManager::default()
    }

    /// Registers a device, notifying `observers` on success.
    ///
    /// Fails without mutating anything if `device.serial` is already registered.
    pub fn add_device(
        &mut self,
        device: Device,
        observers: &[&dyn DeviceLifecycleObserver],
    ) -> Result<(), DuplicateSerial> {
        if self.devices.contains_key(&device.serial) {
            return Err(DuplicateSerial(device.serial));
        }
        let serial = device.serial;
        self.devices.insert(serial, device);
        self.order.push(serial);
        tracing::info!(%serial, "device registered");
        for observer in observers {
            observer.on_device_added(serial);
        }
        Ok(())
    }

    /// Removes a device by serial, notifying `observers` if it was present.
    pub fn remove_device(&mut self, serial: Serial, observers: &[&dyn DeviceLifecycleObserver]) -> Option<Device> {
        let removed = self.devices.remove(&serial);
        if removed.is_some() {
            self.order.retain(|s| *s != serial);
            tracing::info!(%serial, "device removed");
            for observer in observers {
                observer.on_device_removed(serial);
            }
        }
        removed
    }

    pub fn get_device(&self, serial: Serial) -> Option<&Device> {
        self.devices.get(&serial)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterates registered devices in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.order.iter().filter_map(|serial| self.devices.get(serial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::ffi::CStr;
    use std::sync::Arc;

    fn label() -> lifx_protocol::LifxString {
        lifx_protocol::LifxString::new(CStr::from_bytes_with_nul(b"\0").unwrap())
    }

    fn device(serial: [u8; 6]) -> Device {
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(SystemClock);
        Device::new(Serial(serial), 1, 1, label(), clock).unwrap()
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let mut mgr = DeviceManager::new();
        mgr.add_device(device([1, 0, 0, 0, 0, 0]), &[]).unwrap();
        assert!(mgr.get_device(Serial([1, 0, 0, 0, 0, 0])).is_some());
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let mut mgr = DeviceManager::new();
        mgr.add_device(device([1, 0, 0, 0, 0, 0]), &[]).unwrap();
        let err = mgr.add_device(device([1, 0, 0, 0, 0, 0]), &[]).unwrap_err();
        assert_eq!(err.0, Serial([1, 0, 0, 0, 0, 0]));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut mgr = DeviceManager::new();
        mgr.add_device(device([3, 0, 0, 0, 0, 0]), &[]).unwrap();
        mgr.add_device(device([1, 0, 0, 0, 0, 0]), &[]).unwrap();
        mgr.add_device(device([2, 0, 0, 0, 0, 0]), &[]).unwrap();
        let serials: Vec<Serial> = mgr.iter().map(|d| d.serial).collect();
        assert_eq!(
            serials,
            vec![
                Serial([3, 0, 0, 0, 0, 0]),
                Serial([1, 0, 0, 0, 0, 0]),
                Serial([2, 0, 0, 0, 0, 0]),
            ]
        );
    }

    #[test]
    fn remove_device_drops_it_from_iteration() {
        let mut mgr = DeviceManager::new();
        mgr.add_device(device([1, 0, 0, 0, 0, 0]), &[]).unwrap();
        mgr.add_device(device([2, 0, 0, 0, 0, 0]), &[]).unwrap();
        let removed = mgr.remove_device(Serial([1, 0, 0, 0, 0, 0]), &[]);
        assert!(removed.is_some());
        assert_eq!(mgr.iter().count(), 1);
    }
}
