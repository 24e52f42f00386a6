//! Channel pool bookkeeping across attached devices.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::scheduler::Scheduler;

struct DeviceEntry {
    id: String,
    device: Arc<dyn Device>,
    scheduler: Arc<dyn Scheduler>,
    busy: Vec<bool>,
}

/// Registry of attached devices and their channel pools.
///
/// Devices are scanned in registration order, so channel acquisition is
/// deterministic and reproducible.
#[derive(Default)]
pub struct DeviceManager {
    devices: Mutex<Vec<DeviceEntry>>,
}

fn lock(devices: &Mutex<Vec<DeviceEntry>>) -> MutexGuard<'_, Vec<DeviceEntry>> {
    devices.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and its scheduler under a unique id.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidConfiguration`] if the id is taken.
    pub fn add(
        &self,
        id: impl Into<String>,
        device: Arc<dyn Device>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<()> {
        let id = id.into();
        let mut devices = lock(&self.devices);
        if devices.iter().any(|entry| entry.id == id) {
            return Err(DriverError::invalid_configuration(format!(
                "device {id} already added"
            )));
        }
        let busy = vec![false; device.channels()];
        devices.push(DeviceEntry {
            id,
            device,
            scheduler,
            busy,
        });
        Ok(())
    }

    /// Acquire the first free channel, scanning devices in registration
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NoChannelsLeft`] if every channel is in use.
    pub fn acquire_channel(&self) -> Result<(String, usize)> {
        let mut devices = lock(&self.devices);
        for entry in devices.iter_mut() {
            if let Some(channel) = entry.busy.iter().position(|used| !used) {
                entry.busy[channel] = true;
                debug!("acquired channel {channel} on {}", entry.id);
                return Ok((entry.id.clone(), channel));
            }
        }
        Err(DriverError::NoChannelsLeft)
    }

    /// Release a previously acquired channel.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::InvalidConfiguration`] for an unknown id or a
    /// channel number the device does not have.
    pub fn release_channel(&self, id: &str, channel: usize) -> Result<()> {
        let mut devices = lock(&self.devices);
        let entry = devices
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| {
                DriverError::invalid_configuration(format!("device {id} not found"))
            })?;
        let slot = entry.busy.get_mut(channel).ok_or_else(|| {
            DriverError::invalid_configuration(format!(
                "channel {channel} not provided by device {id}"
            ))
        })?;
        *slot = false;
        debug!("released channel {channel} on {id}");
        Ok(())
    }

    /// Look up the device and scheduler registered under an id.
    pub fn get(&self, id: &str) -> Option<(Arc<dyn Device>, Arc<dyn Scheduler>)> {
        lock(&self.devices)
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| (Arc::clone(&entry.device), Arc::clone(&entry.scheduler)))
    }
}
