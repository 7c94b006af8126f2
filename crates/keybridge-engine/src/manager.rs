//! The capture manager: seized device handles, owned by the listener loop.
//!
//! Everything here runs on the listener loop thread. Handles are not `Send`
//! and never leave it.

use std::collections::BTreeMap;
use std::sync::Arc;

use keybridge_hid::{HidPlatform, SeizedDevice};
use keybridge_types::{DeviceLocator, IdentityHash, PresentDevice};
use tracing::{debug, info, warn};

use crate::channel::EventWriter;
use crate::registry::SharedRegistered;

struct OpenDevice {
    name: String,
    handle: Box<dyn SeizedDevice>,
}

/// Outcome of [`CaptureManager::release_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
}

pub struct CaptureManager<P> {
    platform: Arc<P>,
    writer: EventWriter,
    registered: SharedRegistered,
    /// At most one handle per identity.
    open: BTreeMap<IdentityHash, OpenDevice>,
}

impl<P: HidPlatform> CaptureManager<P> {
    pub fn new(platform: Arc<P>, writer: EventWriter, registered: SharedRegistered) -> Self {
        Self {
            platform,
            writer,
            registered,
            open: BTreeMap::new(),
        }
    }

    /// Add identities to the session's registered set.
    pub fn register(&mut self, hashes: impl IntoIterator<Item = IdentityHash>) {
        self.registered.extend(hashes);
    }

    pub fn is_registered(&self, hash: IdentityHash) -> bool {
        self.registered.contains(hash)
    }

    pub fn is_open(&self, hash: IdentityHash) -> bool {
        self.open.contains_key(&hash)
    }

    pub fn open_identities(&self) -> Vec<IdentityHash> {
        self.open.keys().copied().collect()
    }

    /// Seize `device` and route its value changes into the event channel.
    /// Returns false if the identity is already open or the OS refused.
    pub fn capture(&mut self, device: &PresentDevice) -> bool {
        let hash = device.identity();
        if self.open.contains_key(&hash) {
            debug!(device = %device.info.name, identity = %hash, "already open, not capturing again");
            return false;
        }

        let writer = self.writer.clone();
        match self
            .platform
            .seize(device, Box::new(move |event| writer.emit(event)))
        {
            Ok(handle) => {
                info!(device = %device.info.name, identity = %hash, locator = %device.locator, "captured device");
                self.open.insert(
                    hash,
                    OpenDevice {
                        name: device.info.name.clone(),
                        handle,
                    },
                );
                true
            }
            Err(e) => {
                warn!(
                    device = %device.info.name,
                    code = ?e.os_code(),
                    error = %e,
                    "failed to capture device"
                );
                false
            }
        }
    }

    /// Capture every present registered device that is not open yet.
    /// Returns the identities captured by this call.
    pub fn sweep(&mut self) -> Vec<IdentityHash> {
        let present = match self.platform.enumerate() {
            Ok(present) => present,
            Err(e) => {
                warn!(error = %e, "device enumeration failed during sweep");
                return Vec::new();
            }
        };
        let mut captured = Vec::new();
        for device in present {
            let hash = device.identity();
            if self.registered.contains(hash)
                && !self.open.contains_key(&hash)
                && self.capture(&device)
            {
                captured.push(hash);
            }
        }
        captured
    }

    /// Forget the handle on a device the OS reported removed. The handle is
    /// already invalid, so it is dropped without a close call.
    pub fn forget_removed(&mut self, locator: &DeviceLocator) -> Option<IdentityHash> {
        let hash = self
            .open
            .iter()
            .find(|(_, dev)| dev.handle.locator() == locator)
            .map(|(hash, _)| *hash)?;
        if let Some(dev) = self.open.remove(&hash) {
            info!(device = %dev.name, identity = %hash, "device removed");
        }
        Some(hash)
    }

    /// Close every open handle. A failure on one device is logged and does
    /// not stop the others from being released.
    pub fn release_all(&mut self) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        for (hash, dev) in std::mem::take(&mut self.open) {
            match dev.handle.close() {
                Ok(()) => summary.released += 1,
                Err(e) => {
                    warn!(
                        device = %dev.name,
                        identity = %hash,
                        code = ?e.os_code(),
                        error = %e,
                        "failed to release device"
                    );
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
