//! Platform-abstracted HID capture and virtual sink for keybridge.
//!
//! This crate defines the capabilities keybridge needs from the operating
//! system as traits:
//!
//! - [`HidPlatform`]: enumerate keyboard-class devices, open one with an
//!   exclusive hold and deliver its value changes to a callback, and
//!   subscribe to arrival/removal notifications.
//! - [`VirtualHidClient`]: the connection to the virtual keyboard that the OS
//!   treats as real hardware.
//!
//! The evdev/uinput backend lives in [`linux`] (feature `linux`); in-memory
//! backends for tests live in [`mock`] (feature `mock`).

use std::fmt;
use std::sync::Arc;

use keybridge_types::{CountryCode, DeviceFilter, DeviceLocator, KeyEvent, PresentDevice, Report};
use tokio::sync::mpsc;

pub mod error;
#[cfg(feature = "linux")]
pub mod linux;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::HidError;

/// Value-change callback registered on a seized device. Invoked on the
/// listener loop, once per physical value change.
pub type ValueCallback = Box<dyn Fn(KeyEvent)>;

/// Where a subscription delivers its notifications.
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Kind of OS notification a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A device matching the subscription scope appeared.
    Matched,
    /// A device disappeared.
    Terminated,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A notification delivered on the listener loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `device` appeared; `scope` is the filter of the subscription that saw it.
    Arrival {
        scope: DeviceFilter,
        device: PresentDevice,
    },
    /// `device` was removed. Any open handle on it is already gone.
    Removal { device: PresentDevice },
}

/// An installed notification subscription. Dropping it unsubscribes.
pub struct Subscription {
    kind: NotificationKind,
    scope: DeviceFilter,
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(kind: NotificationKind, scope: DeviceFilter, cancel: impl FnOnce() + 'static) -> Self {
        Self {
            kind,
            scope,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    pub fn scope(&self) -> &DeviceFilter {
        &self.scope
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Result of installing a subscription.
///
/// `initial` is the snapshot of devices that already matched at install
/// time. They are not arrivals; the caller decides what to do with them.
#[derive(Debug)]
pub struct InstalledSubscription {
    pub subscription: Subscription,
    pub initial: Vec<PresentDevice>,
}

/// OS device capabilities.
///
/// `enumerate` may be called from any thread. `seize` and `subscribe` must
/// only be called on the listener loop (inside its tokio `LocalSet`): they
/// schedule work on that loop, and the handles they return are not `Send`.
pub trait HidPlatform: Send + Sync + 'static {
    /// Snapshot of the keyboard-class devices currently present.
    fn enumerate(&self) -> Result<Vec<PresentDevice>, HidError>;

    /// Open `device` exclusively, register `on_value` for its value changes
    /// and schedule it on the current loop.
    fn seize(
        &self,
        device: &PresentDevice,
        on_value: ValueCallback,
    ) -> Result<Box<dyn SeizedDevice>, HidError>;

    /// Install a notification subscription of `kind` restricted to `scope`.
    fn subscribe(
        &self,
        kind: NotificationKind,
        scope: &DeviceFilter,
        tx: NotificationSender,
    ) -> Result<InstalledSubscription, HidError>;
}

/// An exclusively held device.
///
/// Dropping the handle without calling [`SeizedDevice::close`] abandons it,
/// which is what happens after the OS reported the device removed.
pub trait SeizedDevice {
    fn locator(&self) -> &DeviceLocator;

    /// Give the exclusive hold back to the OS.
    fn close(self: Box<Self>) -> Result<(), HidError>;
}

/// Events reported by a virtual sink connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Connected,
    ConnectFailed(String),
    Closed,
    ErrorOccurred(String),
    DriverActivated(bool),
    DriverConnected(bool),
    DriverVersionMismatched(bool),
}

/// Receives [`SinkEvent`]s, possibly from a thread owned by the client.
pub type SinkObserver = Arc<dyn Fn(SinkEvent) + Send + Sync>;

/// Client side of the virtual HID sink.
///
/// The `async_` methods return before the work completes; outcomes are
/// reported through the observer given to [`VirtualHidClient::async_start`].
pub trait VirtualHidClient: Send + Sync + 'static {
    /// Begin connecting. Must not call `observer` while holding internal locks.
    fn async_start(&self, observer: SinkObserver);

    /// Prepare the virtual keyboard for reports.
    fn async_initialize_keyboard(&self, country_code: CountryCode);

    /// Replace the state of `report.category` with `report.keys`.
    fn async_post_report(&self, report: &Report) -> Result<(), HidError>;

    /// Tear the connection down and release its resources.
    fn async_stop(&self);

    /// Whether the sink service is reachable at all, independent of any
    /// connection.
    fn driver_activated(&self) -> bool;
}
