//! Scan session bookkeeping
//! Tracks one bounded discovery window and the devices seen during it.
//! The window timer itself lives in the manager loop.

use log::{debug, info};

use crate::core::bluetooth::types::{DeviceId, DiscoveredDevice};

/// What a discovery report did to the session
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRecord {
    New(DiscoveredDevice),
    Updated(DiscoveredDevice),
    Ignored,
}

pub struct ScanSession {
    devices: Vec<DiscoveredDevice>,
    active: bool,
    skip_unnamed: bool,
}

impl ScanSession {
    pub fn new(skip_unnamed: bool) -> Self {
        Self {
            devices: Vec::new(),
            active: false,
            skip_unnamed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Devices of the current or most recent window, in discovery order
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Open a new window, discarding devices from any previous one
    pub fn start(&mut self) {
        self.devices.clear();
        self.active = true;
        info!("Scan window opened");
    }

    /// Record one discovery report
    pub fn record(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> ScanRecord {
        if !self.active {
            debug!("Discovery of {} outside a scan window ignored", id);
            return ScanRecord::Ignored;
        }

        if let Some(existing) = self.devices.iter_mut().find(|d| d.id == id) {
            let mut changed = false;
            if name.is_some() && existing.name != name {
                existing.name = name;
                changed = true;
            }
            if rssi.is_some() && existing.rssi != rssi {
                existing.rssi = rssi;
                changed = true;
            }
            return if changed {
                ScanRecord::Updated(existing.clone())
            } else {
                ScanRecord::Ignored
            };
        }

        if self.skip_unnamed && name.is_none() {
            debug!("Skipping unnamed device {}", id);
            return ScanRecord::Ignored;
        }

        let device = DiscoveredDevice::new(id, name, rssi);
        info!(
            "Discovered device - ID: {}, Name: {:?}, RSSI: {:?}",
            device.id, device.name, device.rssi
        );
        self.devices.push(device.clone());
        ScanRecord::New(device)
    }

    /// Apply a name change reported by the peripheral
    pub fn rename(&mut self, id: &DeviceId, name: String) -> Option<DiscoveredDevice> {
        let device = self.devices.iter_mut().find(|d| &d.id == id)?;
        if device.name.as_deref() == Some(name.as_str()) {
            return None;
        }
        debug!("Updated name of {}: {}", id, name);
        device.name = Some(name);
        Some(device.clone())
    }

    /// Close the window on expiry. Returns the batch, or `None` if no window
    /// was open.
    pub fn finish(&mut self) -> Option<Vec<DiscoveredDevice>> {
        if !self.active {
            return None;
        }
        self.active = false;
        info!("Scan window closed with {} device(s)", self.devices.len());
        Some(self.devices.clone())
    }

    /// Close the window early. Returns `false` if no window was open.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        if was_active {
            info!("Scan window cancelled");
        }
        was_active
    }
}
