use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};

use super::{DeviceError, Result, Vendor};
use crate::scheduler::Scheduler;
use crate::serial::{HandleId, LineBuffer};

/// State of an open device that the transport read path needs to reach.
pub struct RegisteredDevice {
    pub handle_id: HandleId,
    pub port_name: String,
    pub vendor: Vendor,
    pub buffer: Arc<LineBuffer>,
    pub scheduler: Arc<Scheduler>,
    pub opened_at: DateTime<Utc>,
}

/// Non-owning map from transport handle to device.
///
/// Looked up from reader threads, so it uses a blocking mutex and never holds
/// it across a push into a line buffer.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<HandleId, Weak<RegisteredDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: Mutex::new(HashMap::new()) }
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<HandleId, Weak<RegisteredDevice>>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, device: &Arc<RegisteredDevice>) -> Result<()> {
        let mut devices = self.devices();
        if let Some(existing) = devices.get(&device.handle_id) {
            if existing.strong_count() > 0 {
                return Err(DeviceError::AlreadyRegistered(device.handle_id));
            }
        }
        devices.insert(device.handle_id, Arc::downgrade(device));
        log::debug!("Registered {} ({})", device.handle_id, device.port_name);
        Ok(())
    }

    pub fn lookup(&self, handle_id: HandleId) -> Option<Arc<RegisteredDevice>> {
        self.devices().get(&handle_id).and_then(Weak::upgrade)
    }

    pub fn unregister(&self, handle_id: HandleId) -> bool {
        let removed = self.devices().remove(&handle_id).is_some();
        if removed {
            log::debug!("Unregistered {}", handle_id);
        }
        removed
    }

    /// Deliver inbound bytes to the device owning `handle_id`.
    pub fn route(&self, handle_id: HandleId, bytes: &[u8]) -> bool {
        match self.lookup(handle_id) {
            Some(device) => {
                device.buffer.push(bytes);
                true
            }
            None => {
                log::warn!("Dropping {} byte(s) for unknown handle {}", bytes.len(), handle_id);
                false
            }
        }
    }

    pub fn handles(&self) -> Vec<HandleId> {
        let mut handles: Vec<HandleId> = self.devices().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices().is_empty()
    }

    /// Remove every entry, returning the handles that were still registered.
    pub fn clear(&self) -> Vec<HandleId> {
        let mut devices = self.devices();
        let handles: Vec<HandleId> = devices.keys().copied().collect();
        devices.clear();
        handles
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
