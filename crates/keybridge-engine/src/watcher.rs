//! Arrival/removal watcher.
//!
//! Unarmed until the first registration reaches the listener loop; armed
//! while it holds subscriptions; unarmed again on shutdown. Notifications are
//! delivered as messages on the listener loop and re-drive the capture
//! manager.

use std::sync::Arc;

use keybridge_hid::{HidPlatform, Notification, NotificationKind, NotificationSender, Subscription};
use keybridge_types::{DeviceFilter, IdentityHash, PresentDevice};
use tracing::{debug, info, warn};

use crate::manager::CaptureManager;
use crate::registry::ExclusionPolicy;

pub struct Watcher<P> {
    platform: Arc<P>,
    tx: NotificationSender,
    exclusion: ExclusionPolicy,
    adopt_new_devices: bool,
    subscriptions: Vec<Subscription>,
    /// Scopes with an installed arrival subscription.
    armed_scopes: Vec<DeviceFilter>,
    removal_armed: bool,
}

impl<P: HidPlatform> Watcher<P> {
    pub fn new(
        platform: Arc<P>,
        tx: NotificationSender,
        exclusion: ExclusionPolicy,
        adopt_new_devices: bool,
    ) -> Self {
        Self {
            platform,
            tx,
            exclusion,
            adopt_new_devices,
            subscriptions: Vec::new(),
            armed_scopes: Vec::new(),
            removal_armed: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Install arrival notifications for `scope`, and removal notifications
    /// if none are installed yet.
    pub fn arm(&mut self, scope: &DeviceFilter) {
        if !self.removal_armed {
            self.removal_armed = self.install(NotificationKind::Terminated, &DeviceFilter::All);
        }
        if !self.armed_scopes.contains(scope) && self.install(NotificationKind::Matched, scope) {
            self.armed_scopes.push(scope.clone());
        }
    }

    /// Arm an arrival subscription narrowed to one identity, so a reconnect
    /// of that device re-triggers capture.
    pub fn track(&mut self, hash: IdentityHash) {
        self.arm(&DeviceFilter::Identity(hash));
    }

    fn install(&mut self, kind: NotificationKind, scope: &DeviceFilter) -> bool {
        match self.platform.subscribe(kind, scope, self.tx.clone()) {
            Ok(installed) => {
                // Present devices were handled by the startup sweep.
                if !installed.initial.is_empty() {
                    debug!(%kind, %scope, count = installed.initial.len(), "discarded initial snapshot");
                }
                debug!(%kind, %scope, "armed notification");
                self.subscriptions.push(installed.subscription);
                true
            }
            Err(e) => {
                warn!(%kind, %scope, error = %e, "failed to install notification");
                false
            }
        }
    }

    /// Handle one notification delivered on the listener loop.
    pub fn handle(&mut self, notification: Notification, manager: &mut CaptureManager<P>) {
        match notification {
            Notification::Arrival { scope, device } => self.on_arrival(&scope, &device, manager),
            Notification::Removal { device } => {
                manager.forget_removed(&device.locator);
            }
        }
    }

    fn on_arrival(
        &mut self,
        scope: &DeviceFilter,
        device: &PresentDevice,
        manager: &mut CaptureManager<P>,
    ) {
        let hash = device.identity();
        if !manager.is_registered(hash) {
            if self.adopt_new_devices
                && *scope == DeviceFilter::All
                && !self.exclusion.is_excluded(&device.info.name)
            {
                info!(device = %device.info.name, identity = %hash, "adopting new device");
                manager.register([hash]);
            } else {
                debug!(device = %device.info.name, identity = %hash, "ignoring unregistered device");
                return;
            }
        }
        if manager.is_open(hash) {
            debug!(device = %device.info.name, identity = %hash, "arrival for open device ignored");
            return;
        }
        if manager.capture(device) {
            self.track(hash);
        }
    }

    /// Drop every subscription.
    pub fn disarm(&mut self) {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        self.armed_scopes.clear();
        self.removal_armed = false;
        if count > 0 {
            debug!(count, "disarmed notifications");
        }
    }
}
