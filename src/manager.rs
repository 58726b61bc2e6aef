//! Board registry and exclusive sessions.
//!
//! A [`DeviceManager`] is created explicitly by the host and hands out minor
//! numbers from an atomic counter. Each registered board can be open by at most
//! one [`Session`] at a time; dropping the session hard-resets the board and
//! frees its buffers.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::DragonConfig;
use crate::device::DragonDevice;
use crate::error::{DragonError, DragonResult};
use crate::hardware::{DmaBackend, RegisterInterface};

struct Slot {
    minor: u32,
    name: String,
    device: DragonDevice,
    available: AtomicBool,
}

/// Registry of boards attached to this host.
pub struct DeviceManager {
    config: DragonConfig,
    next_minor: AtomicU32,
    devices: RwLock<BTreeMap<u32, Arc<Slot>>>,
}

impl DeviceManager {
    /// Empty registry; every board registered later uses `config`.
    pub fn new(config: DragonConfig) -> Self {
        Self {
            config,
            next_minor: AtomicU32::new(0),
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Configuration shared by all boards.
    pub fn config(&self) -> &DragonConfig {
        &self.config
    }

    /// Registers a detected board and returns its minor number.
    ///
    /// Minor numbers are never reused, even after [`DeviceManager::remove`].
    pub fn register(
        &self,
        regs: Arc<dyn RegisterInterface>,
        dma: Arc<dyn DmaBackend>,
    ) -> DragonResult<u32> {
        let max = self.config.max_devices;
        let minor = self
            .next_minor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                (m < max).then_some(m + 1)
            })
            .map_err(|_| DragonError::TooManyDevices(max))?;

        let device = DragonDevice::new(regs, dma, self.config.device_options());
        let name = format!("dragon{minor}");
        info!(
            minor,
            name = %name,
            family = %self.config.family,
            device_id = device.device_id(),
            "device registered"
        );
        self.devices.write().insert(
            minor,
            Arc::new(Slot {
                minor,
                name,
                device,
                available: AtomicBool::new(true),
            }),
        );
        Ok(minor)
    }

    /// Unregisters a board that has no open session.
    pub fn remove(&self, minor: u32) -> DragonResult<()> {
        let mut devices = self.devices.write();
        let slot = devices.get(&minor).ok_or(DragonError::NoSuchDevice(minor))?;
        if !slot.available.load(Ordering::Acquire) {
            return Err(DragonError::DeviceBusy(slot.name.clone()));
        }
        info!(minor, name = %slot.name, "device removed");
        devices.remove(&minor);
        Ok(())
    }

    /// Opens board `minor` exclusively, programming factory parameters.
    pub fn open(&self, minor: u32) -> DragonResult<Session> {
        // Claimed under the map lock so `remove` cannot drop a slot being opened.
        let slot = {
            let devices = self.devices.read();
            let slot = devices.get(&minor).ok_or(DragonError::NoSuchDevice(minor))?;
            if slot
                .available
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(DragonError::DeviceBusy(slot.name.clone()));
            }
            Arc::clone(slot)
        };

        if let Err(e) = slot.device.open_session() {
            slot.available.store(true, Ordering::Release);
            return Err(e);
        }
        info!(minor, name = %slot.name, "device opened");
        Ok(Session { slot })
    }

    /// Registered names, in minor order.
    pub fn device_names(&self) -> Vec<String> {
        self.devices.read().values().map(|s| s.name.clone()).collect()
    }

    /// Number of registered boards.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no board is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

/// Exclusive open handle. Dereferences to the board's [`DragonDevice`].
pub struct Session {
    slot: Arc<Slot>,
}

impl Session {
    /// Minor number of the open board.
    pub fn minor(&self) -> u32 {
        self.slot.minor
    }

    /// Device name, `dragon<minor>`.
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// The board's engine.
    pub fn device(&self) -> &DragonDevice {
        &self.slot.device
    }
}

impl Deref for Session {
    type Target = DragonDevice;

    fn deref(&self) -> &DragonDevice {
        &self.slot.device
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.slot.device.close_session() {
            error!(name = %self.slot.name, error = %e, "session close failed");
        }
        self.slot.available.store(true, Ordering::Release);
        info!(name = %self.slot.name, "device closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.slot.name)
            .finish_non_exhaustive()
    }
}
