//! Mock HID backends for testing.
//!
//! [`MockPlatform`] simulates a set of present keyboards. Tests drive it
//! through a [`MockPlatformHandle`]: plug and unplug devices, press keys on
//! seized devices, cut a seized device's stream, and make seize, close or
//! subscribe fail. [`MockClient`] records every
//! report posted to the virtual sink and lets tests emit sink events.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keybridge_types::{
    Category, CountryCode, DeviceFilter, DeviceInfo, DeviceLocator, KeyEvent, PresentDevice,
    Report,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::HidError;
use crate::{
    HidPlatform, InstalledSubscription, Notification, NotificationKind, NotificationSender,
    SeizedDevice, SinkEvent, SinkObserver, Subscription, ValueCallback, VirtualHidClient,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MockPlatform
// ---------------------------------------------------------------------------

struct MockSubscriber {
    kind: NotificationKind,
    scope: DeviceFilter,
    tx: NotificationSender,
}

#[derive(Default)]
struct MockPlatformState {
    present: Vec<PresentDevice>,
    /// Feed for every device with a live seized handle.
    seized: BTreeMap<DeviceLocator, mpsc::UnboundedSender<KeyEvent>>,
    fail_seize: BTreeSet<DeviceLocator>,
    fail_close: BTreeSet<DeviceLocator>,
    fail_subscribe: Vec<NotificationKind>,
    closed: Vec<DeviceLocator>,
    subscribers: BTreeMap<u64, MockSubscriber>,
    next_subscriber: u64,
    next_locator: u64,
}

impl MockPlatformState {
    fn notify_arrival(&self, device: &PresentDevice) {
        for subscriber in self.subscribers.values() {
            if subscriber.kind == NotificationKind::Matched && subscriber.scope.matches(&device.info)
            {
                let _ = subscriber.tx.send(Notification::Arrival {
                    scope: subscriber.scope.clone(),
                    device: device.clone(),
                });
            }
        }
    }

    fn notify_removal(&self, device: &PresentDevice) {
        for subscriber in self.subscribers.values() {
            if subscriber.kind == NotificationKind::Terminated {
                let _ = subscriber.tx.send(Notification::Removal {
                    device: device.clone(),
                });
            }
        }
    }
}

/// In-memory device platform.
pub struct MockPlatform {
    state: Arc<Mutex<MockPlatformState>>,
}

impl MockPlatform {
    /// Create an empty platform and the handle tests use to drive it.
    pub fn new() -> (Self, MockPlatformHandle) {
        let state = Arc::new(Mutex::new(MockPlatformState::default()));
        let handle = MockPlatformHandle {
            state: Arc::clone(&state),
        };
        (Self { state }, handle)
    }
}

impl HidPlatform for MockPlatform {
    fn enumerate(&self) -> Result<Vec<PresentDevice>, HidError> {
        Ok(lock(&self.state).present.clone())
    }

    fn seize(
        &self,
        device: &PresentDevice,
        on_value: ValueCallback,
    ) -> Result<Box<dyn SeizedDevice>, HidError> {
        let mut state = lock(&self.state);
        if state.fail_seize.contains(&device.locator) {
            return Err(HidError::DeviceSeize {
                device: device.info.name.clone(),
                code: Some(-536_870_203),
                reason: "exclusive access denied".into(),
            });
        }
        if !state.present.iter().any(|d| d.locator == device.locator) {
            return Err(HidError::DeviceOpen {
                device: device.info.name.clone(),
                code: None,
                reason: "no such device".into(),
            });
        }

        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<KeyEvent>();
        state.seized.insert(device.locator.clone(), feed_tx);
        drop(state);

        let shared = Arc::clone(&self.state);
        let seized = device.clone();
        let task = tokio::task::spawn_local(async move {
            while let Some(event) = feed_rx.recv().await {
                on_value(event);
            }
            // The feed ends on unplug (already notified) or on interrupt,
            // where the device is still present and a rescan sees it again.
            let state = lock(&shared);
            if state.present.iter().any(|d| d.locator == seized.locator) {
                state.notify_removal(&seized);
                state.notify_arrival(&seized);
            }
        });

        Ok(Box::new(MockSeized {
            locator: device.locator.clone(),
            state: Arc::clone(&self.state),
            task,
        }))
    }

    fn subscribe(
        &self,
        kind: NotificationKind,
        scope: &DeviceFilter,
        tx: NotificationSender,
    ) -> Result<InstalledSubscription, HidError> {
        let mut state = lock(&self.state);
        if state.fail_subscribe.contains(&kind) {
            return Err(HidError::Subscribe {
                kind,
                reason: "notification port unavailable".into(),
            });
        }
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(
            id,
            MockSubscriber {
                kind,
                scope: scope.clone(),
                tx,
            },
        );
        let initial = match kind {
            NotificationKind::Matched => state
                .present
                .iter()
                .filter(|d| scope.matches(&d.info))
                .cloned()
                .collect(),
            NotificationKind::Terminated => Vec::new(),
        };
        drop(state);

        let shared = Arc::clone(&self.state);
        let subscription = Subscription::new(kind, scope.clone(), move || {
            lock(&shared).subscribers.remove(&id);
        });
        Ok(InstalledSubscription {
            subscription,
            initial,
        })
    }
}

struct MockSeized {
    locator: DeviceLocator,
    state: Arc<Mutex<MockPlatformState>>,
    task: JoinHandle<()>,
}

impl SeizedDevice for MockSeized {
    fn locator(&self) -> &DeviceLocator {
        &self.locator
    }

    fn close(self: Box<Self>) -> Result<(), HidError> {
        let mut state = lock(&self.state);
        if state.fail_close.contains(&self.locator) {
            return Err(HidError::DeviceClose {
                device: self.locator.to_string(),
                code: Some(-536_870_212),
                reason: "device not responding".into(),
            });
        }
        state.closed.push(self.locator.clone());
        Ok(())
    }
}

impl Drop for MockSeized {
    fn drop(&mut self) {
        self.task.abort();
        lock(&self.state).seized.remove(&self.locator);
    }
}

/// Clonable handle for driving a [`MockPlatform`] from tests.
#[derive(Clone)]
pub struct MockPlatformHandle {
    state: Arc<Mutex<MockPlatformState>>,
}

impl MockPlatformHandle {
    /// Make a device present without notifying anyone, as if it had been
    /// connected before the session started.
    pub fn add_device(&self, name: &str, vendor_id: u32, product_id: u32) -> PresentDevice {
        let mut state = lock(&self.state);
        let device = PresentDevice {
            info: DeviceInfo::new(name, vendor_id, product_id),
            locator: DeviceLocator(format!("mock{}", state.next_locator)),
        };
        state.next_locator += 1;
        state.present.push(device.clone());
        device
    }

    /// Connect a device and deliver arrivals to matching subscriptions.
    pub fn plug(&self, name: &str, vendor_id: u32, product_id: u32) -> PresentDevice {
        let device = self.add_device(name, vendor_id, product_id);
        lock(&self.state).notify_arrival(&device);
        device
    }

    /// Disconnect a device. Its seized handle (if any) stops delivering and
    /// removal subscriptions are notified.
    pub fn unplug(&self, locator: &DeviceLocator) {
        let mut state = lock(&self.state);
        let Some(pos) = state.present.iter().position(|d| d.locator == *locator) else {
            return;
        };
        let device = state.present.remove(pos);
        state.seized.remove(locator);
        state.notify_removal(&device);
    }

    /// End the event stream of a seized device that stays connected, as a
    /// driver reset does. Subscribers see a removal followed by an arrival
    /// once the seized handle notices. Returns false if it was not seized.
    pub fn interrupt(&self, locator: &DeviceLocator) -> bool {
        lock(&self.state).seized.remove(locator).is_some()
    }

    /// Deliver a value change from a seized device. Returns false if the
    /// device is not currently seized.
    pub fn press(&self, locator: &DeviceLocator, event: KeyEvent) -> bool {
        lock(&self.state)
            .seized
            .get(locator)
            .is_some_and(|feed| feed.send(event).is_ok())
    }

    pub fn fail_seize(&self, locator: &DeviceLocator) {
        lock(&self.state).fail_seize.insert(locator.clone());
    }

    pub fn fail_close(&self, locator: &DeviceLocator) {
        lock(&self.state).fail_close.insert(locator.clone());
    }

    /// Make every later subscription of `kind` fail.
    pub fn fail_subscribe(&self, kind: NotificationKind) {
        let mut state = lock(&self.state);
        if !state.fail_subscribe.contains(&kind) {
            state.fail_subscribe.push(kind);
        }
    }

    pub fn clear_subscribe_failures(&self) {
        lock(&self.state).fail_subscribe.clear();
    }

    /// Devices whose handle was closed successfully, in order.
    pub fn closed(&self) -> Vec<DeviceLocator> {
        lock(&self.state).closed.clone()
    }

    pub fn is_seized(&self, locator: &DeviceLocator) -> bool {
        lock(&self.state).seized.contains_key(locator)
    }

    pub fn seized_count(&self) -> usize {
        lock(&self.state).seized.len()
    }

    pub fn subscription_count(&self, kind: NotificationKind) -> usize {
        lock(&self.state)
            .subscribers
            .values()
            .filter(|s| s.kind == kind)
            .count()
    }
}

// ---------------------------------------------------------------------------
// MockClient
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockClientState {
    observer: Option<SinkObserver>,
    started: bool,
    stopped: bool,
    manual_connect: bool,
    fail_post: bool,
    driver_missing: bool,
    country: Option<CountryCode>,
    reports: Vec<Report>,
}

/// Virtual sink that records reports instead of injecting them.
///
/// By default it reports [`SinkEvent::Connected`] as soon as it is started.
#[derive(Default)]
pub struct MockClient {
    state: Arc<Mutex<MockClientState>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clonable handle for observing the client from tests.
    pub fn handle(&self) -> MockClientHandle {
        MockClientHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl VirtualHidClient for MockClient {
    fn async_start(&self, observer: SinkObserver) {
        let connect = {
            let mut state = lock(&self.state);
            state.started = true;
            state.stopped = false;
            state.observer = Some(Arc::clone(&observer));
            !state.manual_connect
        };
        if connect {
            observer(SinkEvent::Connected);
        }
    }

    fn async_initialize_keyboard(&self, country_code: CountryCode) {
        lock(&self.state).country = Some(country_code);
    }

    fn async_post_report(&self, report: &Report) -> Result<(), HidError> {
        let mut state = lock(&self.state);
        if state.fail_post {
            return Err(HidError::Post("sink rejected report".into()));
        }
        state.reports.push(report.clone());
        Ok(())
    }

    fn async_stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.observer = None;
    }

    fn driver_activated(&self) -> bool {
        !lock(&self.state).driver_missing
    }
}

/// Clonable observer handle for [`MockClient`].
#[derive(Clone)]
pub struct MockClientHandle {
    state: Arc<Mutex<MockClientState>>,
}

impl MockClientHandle {
    /// Every report posted so far, in order.
    pub fn reports(&self) -> Vec<Report> {
        lock(&self.state).reports.clone()
    }

    /// The most recent report posted for `category`.
    pub fn last_report(&self, category: Category) -> Option<Report> {
        lock(&self.state)
            .reports
            .iter()
            .rev()
            .find(|r| r.category == category)
            .cloned()
    }

    pub fn clear_reports(&self) {
        lock(&self.state).reports.clear();
    }

    /// Deliver `event` to the observer installed by `async_start`, if any.
    pub fn emit(&self, event: SinkEvent) {
        let observer = lock(&self.state).observer.clone();
        if let Some(observer) = observer {
            observer(event);
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Country code the keyboard was initialized with, if initialized.
    pub fn keyboard_country(&self) -> Option<CountryCode> {
        lock(&self.state).country
    }

    /// When false, `async_start` waits for the test to emit `Connected`.
    pub fn set_auto_connect(&self, auto: bool) {
        lock(&self.state).manual_connect = !auto;
    }

    pub fn set_fail_post(&self, fail: bool) {
        lock(&self.state).fail_post = fail;
    }

    pub fn set_driver_activated(&self, activated: bool) {
        lock(&self.state).driver_missing = !activated;
    }
}
