//! Device registry
//!
//! Every device gets its own slot. The slot holds the device definition,
//! its last-sync bookkeeping and the cycle currently running against it, so
//! nothing here needs a lock over all devices while a cycle is in progress.

use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Device, DeviceSyncState, SyncOutcome, SyncResult};

/// A running device cycle that any number of callers can await
pub(crate) type InFlightCycle = Shared<BoxFuture<'static, SyncResult>>;

/// Consecutive failures after which each further failure is logged as a warning
const FAILURE_WARN_THRESHOLD: u32 = 3;

pub(crate) struct DeviceSlot {
    device: RwLock<Device>,
    state: Mutex<DeviceSyncState>,
    pub(crate) in_flight: Mutex<Option<InFlightCycle>>,
}

impl DeviceSlot {
    fn new(device: Device) -> Self {
        Self {
            device: RwLock::new(device),
            state: Mutex::new(DeviceSyncState::default()),
            in_flight: Mutex::new(None),
        }
    }

    pub(crate) fn device(&self) -> Device {
        self.device.read().clone()
    }

    pub(crate) fn sync_state(&self) -> DeviceSyncState {
        self.state.lock().clone()
    }
}

/// Device and its last-sync status, as reported to hosts
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device: Device,
    #[serde(flatten)]
    pub sync: DeviceSyncState,
    pub syncing: bool,
}

#[derive(Default)]
pub struct DeviceRegistry {
    slots: RwLock<HashMap<String, Arc<DeviceSlot>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let registry = Self::new();
        for device in devices {
            registry.upsert(device);
        }
        registry
    }

    /// Add a device or replace its definition; sync bookkeeping is kept
    pub fn upsert(&self, device: Device) {
        let mut slots = self.slots.write();
        match slots.get(&device.id) {
            Some(slot) => {
                log::info!("[registry] Updated device {}", device.id);
                *slot.device.write() = device;
            }
            None => {
                log::info!("[registry] Registered device {} ({})", device.id, device.endpoint());
                slots.insert(device.id.clone(), Arc::new(DeviceSlot::new(device)));
            }
        }
    }

    /// A cycle already running against the device finishes normally
    pub fn remove(&self, device_id: &str) -> Option<Device> {
        let removed = self.slots.write().remove(device_id);
        removed.map(|slot| {
            log::info!("[registry] Removed device {}", device_id);
            slot.device()
        })
    }

    pub fn set_enabled(&self, device_id: &str, enabled: bool) -> bool {
        match self.slot(device_id) {
            Some(slot) => {
                slot.device.write().enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.slot(device_id).map(|slot| slot.device())
    }

    pub(crate) fn slot(&self, device_id: &str) -> Option<Arc<DeviceSlot>> {
        self.slots.read().get(device_id).cloned()
    }

    pub fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.slot(device_id).map(|slot| Self::status_of(&slot))
    }

    pub fn list_all(&self) -> Vec<DeviceStatus> {
        let mut all: Vec<DeviceStatus> = self
            .slots
            .read()
            .values()
            .map(|slot| Self::status_of(slot))
            .collect();
        all.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        all
    }

    fn status_of(slot: &DeviceSlot) -> DeviceStatus {
        DeviceStatus {
            device: slot.device(),
            sync: slot.sync_state(),
            syncing: slot.in_flight.lock().is_some(),
        }
    }

    /// Enabled devices, least recently synced successfully first
    pub fn list_enabled(&self) -> Vec<Device> {
        let mut enabled: Vec<(Device, DeviceSyncState)> = self
            .slots
            .read()
            .values()
            .map(|slot| (slot.device(), slot.sync_state()))
            .filter(|(device, _)| device.enabled)
            .collect();
        // None sorts before Some, so never-synced devices go first
        enabled.sort_by(|(a, a_state), (b, b_state)| {
            a_state
                .last_success_at
                .cmp(&b_state.last_success_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        enabled.into_iter().map(|(device, _)| device).collect()
    }

    /// Update last-sync bookkeeping. Never fails; unknown ids are logged.
    pub fn record_result(&self, device_id: &str, result: &SyncResult) {
        let Some(slot) = self.slot(device_id) else {
            log::warn!(
                "[registry] Dropping result for unregistered device {}",
                device_id
            );
            return;
        };

        let mut state = slot.state.lock();
        state.last_sync_at = Some(result.cycle_at);
        match &result.outcome {
            SyncOutcome::Failure(reason) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= FAILURE_WARN_THRESHOLD {
                    log::warn!(
                        "[registry] {} has failed {} cycles in a row: {}",
                        device_id,
                        state.consecutive_failures,
                        reason
                    );
                }
            }
            SyncOutcome::Success | SyncOutcome::PartialFailure(_) => {
                state.last_success_at = Some(result.cycle_at);
                state.consecutive_failures = 0;
            }
        }
        state.last_outcome = Some(result.outcome.clone());
    }
}
