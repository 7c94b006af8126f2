//! evdev-based device capture for Linux.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use evdev::{Device, EventSummary, EventType, KeyCode as EvdevKey};
use keybridge_types::{DeviceFilter, DeviceInfo, DeviceLocator, KeyEvent, PresentDevice};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::keymap;
use crate::error::HidError;
use crate::{
    HidPlatform, InstalledSubscription, Notification, NotificationKind, NotificationSender,
    SeizedDevice, Subscription, ValueCallback,
};

const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Watch {
    kind: NotificationKind,
    scope: DeviceFilter,
    tx: NotificationSender,
}

/// Subscriptions and the device snapshot they are diffed against. One
/// poller serves every subscription; it runs while at least one exists.
#[derive(Default)]
struct Hub {
    watches: BTreeMap<u64, Watch>,
    next_id: u64,
    known: BTreeMap<DeviceLocator, PresentDevice>,
    poller: Option<AbortHandle>,
}

impl Hub {
    /// Diff `current` against the last snapshot and notify. A node that now
    /// carries a different identity counts as a removal and an arrival.
    /// Removals are delivered first.
    fn rescan(&mut self, current: Vec<PresentDevice>) {
        let current: BTreeMap<DeviceLocator, PresentDevice> = current
            .into_iter()
            .map(|d| (d.locator.clone(), d))
            .collect();
        let removed: Vec<PresentDevice> = self
            .known
            .values()
            .filter(|d| !same_device(current.get(&d.locator), d))
            .cloned()
            .collect();
        let arrived: Vec<PresentDevice> = current
            .values()
            .filter(|d| !same_device(self.known.get(&d.locator), d))
            .cloned()
            .collect();
        self.known = current;
        for device in &removed {
            self.notify_removal(device);
        }
        for device in &arrived {
            self.notify_arrival(device);
        }
    }

    /// A seized device's stream ended. Report it gone now; if the node is
    /// still there the next rescan reports it as a new arrival.
    fn lost(&mut self, locator: &DeviceLocator) {
        if let Some(device) = self.known.remove(locator) {
            self.notify_removal(&device);
        }
    }

    fn notify_arrival(&self, device: &PresentDevice) {
        for watch in self.watches.values() {
            if watch.kind == NotificationKind::Matched && watch.scope.matches(&device.info) {
                let _ = watch.tx.send(Notification::Arrival {
                    scope: watch.scope.clone(),
                    device: device.clone(),
                });
            }
        }
    }

    fn notify_removal(&self, device: &PresentDevice) {
        for watch in self.watches.values() {
            if watch.kind == NotificationKind::Terminated {
                let _ = watch.tx.send(Notification::Removal {
                    device: device.clone(),
                });
            }
        }
    }

    fn unwatch(&mut self, id: u64) {
        self.watches.remove(&id);
        if self.watches.is_empty() {
            if let Some(poller) = self.poller.take() {
                poller.abort();
            }
            self.known.clear();
        }
    }
}

fn same_device(seen: Option<&PresentDevice>, device: &PresentDevice) -> bool {
    seen.is_some_and(|seen| seen.identity() == device.identity())
}

/// Linux device platform using evdev.
///
/// Devices are `/dev/input/event*` nodes; a seized device is held with
/// `EVIOCGRAB` so no other reader sees its events. Arrival and removal are
/// detected by rescanning the input directory every `rescan_interval`, and
/// a seized device whose event stream fails is reported removed at once.
pub struct EvdevPlatform {
    rescan_interval: Duration,
    hub: Arc<Mutex<Hub>>,
}

impl Default for EvdevPlatform {
    fn default() -> Self {
        Self::new(DEFAULT_RESCAN_INTERVAL)
    }
}

impl EvdevPlatform {
    pub fn new(rescan_interval: Duration) -> Self {
        Self {
            rescan_interval,
            hub: Arc::new(Mutex::new(Hub::default())),
        }
    }

    /// Enumerate keyboard-class input devices, ordered by device node.
    pub fn enumerate_keyboards() -> Vec<PresentDevice> {
        let mut result: Vec<PresentDevice> = evdev::enumerate()
            .filter(|(_, device)| is_keyboard(device))
            .map(|(path, device)| present_device(&path, &device))
            .collect();
        result.sort_by(|a, b| a.locator.cmp(&b.locator));
        result
    }
}

async fn poll_devices(hub: Weak<Mutex<Hub>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let current = EvdevPlatform::enumerate_keyboards();
        let Some(hub) = hub.upgrade() else {
            return;
        };
        lock(&hub).rescan(current);
    }
}

/// A device counts as a keyboard if it reports letter and enter keys.
fn is_keyboard(device: &Device) -> bool {
    if !device.supported_events().contains(EventType::KEY) {
        return false;
    }
    device.supported_keys().is_some_and(|keys| {
        keys.contains(EvdevKey::KEY_A)
            && keys.contains(EvdevKey::KEY_Z)
            && keys.contains(EvdevKey::KEY_ENTER)
    })
}

fn present_device(path: &Path, device: &Device) -> PresentDevice {
    let id = device.input_id();
    let name = device.name().unwrap_or("Unknown Device");
    PresentDevice {
        info: DeviceInfo::new(name, u32::from(id.vendor()), u32::from(id.product())),
        locator: DeviceLocator(path.display().to_string()),
    }
}

impl HidPlatform for EvdevPlatform {
    fn enumerate(&self) -> Result<Vec<PresentDevice>, HidError> {
        Ok(Self::enumerate_keyboards())
    }

    fn seize(
        &self,
        device: &PresentDevice,
        on_value: ValueCallback,
    ) -> Result<Box<dyn SeizedDevice>, HidError> {
        let name = device.info.name.clone();
        let path = PathBuf::from(&device.locator.0);

        let mut evdev_device = Device::open(&path).map_err(|e| HidError::DeviceOpen {
            device: name.clone(),
            code: e.raw_os_error(),
            reason: e.to_string(),
        })?;
        evdev_device.grab().map_err(|e| HidError::DeviceSeize {
            device: name.clone(),
            code: e.raw_os_error(),
            reason: e.to_string(),
        })?;
        let mut stream = evdev_device
            .into_event_stream()
            .map_err(|e| HidError::DeviceOpen {
                device: name.clone(),
                code: e.raw_os_error(),
                reason: e.to_string(),
            })?;

        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let task_name = name.clone();
        let locator = device.locator.clone();
        let hub = Arc::downgrade(&self.hub);
        let task = tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        match stream.device_mut().ungrab() {
                            Ok(()) => info!(device = %task_name, "released device"),
                            Err(e) => warn!(
                                device = %task_name,
                                code = ?e.raw_os_error(),
                                error = %e,
                                "failed to ungrab device"
                            ),
                        }
                        return;
                    }
                    result = stream.next_event() => match result {
                        Ok(ev) => {
                            if let Some(event) = convert_evdev_event(&ev) {
                                on_value(event);
                            }
                        }
                        Err(e) => {
                            debug!(device = %task_name, error = %e, "device stream ended");
                            break;
                        }
                    }
                }
            }
            if let Some(hub) = hub.upgrade() {
                lock(&hub).lost(&locator);
            }
        });

        info!(device = %name, path = %path.display(), "seized device");
        Ok(Box::new(EvdevSeized {
            locator: device.locator.clone(),
            name,
            close_tx: Some(close_tx),
            task,
        }))
    }

    fn subscribe(
        &self,
        kind: NotificationKind,
        scope: &DeviceFilter,
        tx: NotificationSender,
    ) -> Result<InstalledSubscription, HidError> {
        let mut hub = lock(&self.hub);
        if hub.poller.is_none() {
            hub.known = Self::enumerate_keyboards()
                .into_iter()
                .map(|d| (d.locator.clone(), d))
                .collect();
            let poller =
                tokio::task::spawn_local(poll_devices(Arc::downgrade(&self.hub), self.rescan_interval));
            hub.poller = Some(poller.abort_handle());
            debug!(interval = ?self.rescan_interval, "started device poller");
        }
        let initial = match kind {
            NotificationKind::Matched => hub
                .known
                .values()
                .filter(|d| scope.matches(&d.info))
                .cloned()
                .collect(),
            NotificationKind::Terminated => Vec::new(),
        };
        let id = hub.next_id;
        hub.next_id += 1;
        hub.watches.insert(
            id,
            Watch {
                kind,
                scope: scope.clone(),
                tx,
            },
        );
        drop(hub);

        debug!(%kind, %scope, "installed device notification");
        let shared = Arc::clone(&self.hub);
        Ok(InstalledSubscription {
            subscription: Subscription::new(kind, scope.clone(), move || {
                lock(&shared).unwatch(id);
            }),
            initial,
        })
    }
}

struct EvdevSeized {
    locator: DeviceLocator,
    name: String,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SeizedDevice for EvdevSeized {
    fn locator(&self) -> &DeviceLocator {
        &self.locator
    }

    fn close(mut self: Box<Self>) -> Result<(), HidError> {
        let close_tx = self.close_tx.take();
        match close_tx.map(|tx| tx.send(())) {
            // The grab is dropped on the loop; its outcome is logged there.
            Some(Ok(())) => {
                debug!(device = %self.name, "release requested");
                Ok(())
            }
            _ => {
                warn!(device = %self.name, "device stream already ended");
                Err(HidError::DeviceClose {
                    device: self.name.clone(),
                    code: None,
                    reason: "device stream already ended".into(),
                })
            }
        }
    }
}

impl Drop for EvdevSeized {
    fn drop(&mut self) {
        // Without a close request the reader is abandoned, not released.
        if self.close_tx.is_some() {
            self.task.abort();
        }
    }
}

/// Convert a single evdev event to a key event, if it is a mapped key
/// transition.
fn convert_evdev_event(ev: &evdev::InputEvent) -> Option<KeyEvent> {
    match ev.destructure() {
        EventSummary::Key(_, key, value) => {
            let value = keymap::evdev_value_to_key_value(value)?;
            let (page, usage) = keymap::evdev_key_to_usage(key)?;
            Some(KeyEvent::new(value, page.0, usage))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn device(locator: &str, name: &str) -> PresentDevice {
        PresentDevice {
            info: DeviceInfo::new(name, 1, 2),
            locator: DeviceLocator(locator.into()),
        }
    }

    fn hub_with(
        known: Vec<PresentDevice>,
    ) -> (Hub, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = Hub {
            known: known.into_iter().map(|d| (d.locator.clone(), d)).collect(),
            ..Hub::default()
        };
        for (id, kind) in [NotificationKind::Matched, NotificationKind::Terminated]
            .into_iter()
            .enumerate()
        {
            hub.watches.insert(
                id as u64,
                Watch {
                    kind,
                    scope: DeviceFilter::All,
                    tx: tx.clone(),
                },
            );
        }
        (hub, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn rescan_reports_plug_and_unplug() {
        let old = device("/dev/input/event3", "Old");
        let new = device("/dev/input/event4", "New");
        let (mut hub, mut rx) = hub_with(vec![old.clone()]);

        hub.rescan(vec![new.clone()]);
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::Removal { device: old },
                Notification::Arrival {
                    scope: DeviceFilter::All,
                    device: new.clone(),
                },
            ]
        );

        hub.rescan(vec![new]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn different_device_on_same_node_is_removal_then_arrival() {
        let before = device("/dev/input/event3", "Keyboard A");
        let after = device("/dev/input/event3", "Keyboard B");
        let (mut hub, mut rx) = hub_with(vec![before.clone()]);

        hub.rescan(vec![after.clone()]);
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::Removal { device: before },
                Notification::Arrival {
                    scope: DeviceFilter::All,
                    device: after,
                },
            ]
        );
    }

    #[test]
    fn lost_stream_is_removed_now_and_rediscovered_on_rescan() {
        let kb = device("/dev/input/event3", "USB Keyboard");
        let (mut hub, mut rx) = hub_with(vec![kb.clone()]);

        hub.lost(&kb.locator);
        hub.lost(&kb.locator);
        assert_eq!(
            drain(&mut rx),
            vec![Notification::Removal { device: kb.clone() }]
        );

        // Replugged at the same node before the next tick.
        hub.rescan(vec![kb.clone()]);
        assert_eq!(
            drain(&mut rx),
            vec![Notification::Arrival {
                scope: DeviceFilter::All,
                device: kb,
            }]
        );
    }

    #[test]
    fn scoped_watch_only_sees_matching_arrivals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut hub = Hub::default();
        hub.watches.insert(
            0,
            Watch {
                kind: NotificationKind::Matched,
                scope: DeviceFilter::Name("Wanted".into()),
                tx,
            },
        );
        hub.rescan(vec![
            device("/dev/input/event1", "Other"),
            device("/dev/input/event2", "Wanted"),
        ]);
        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 1);
        assert!(matches!(
            &notes[0],
            Notification::Arrival { device, .. } if device.info.name == "Wanted"
        ));
    }

    #[test]
    fn last_unwatch_clears_the_snapshot() {
        let (mut hub, _rx) = hub_with(vec![device("/dev/input/event3", "USB Keyboard")]);
        hub.unwatch(0);
        assert!(!hub.known.is_empty());
        hub.unwatch(1);
        assert!(hub.known.is_empty());
        assert!(hub.watches.is_empty());
    }
}
