//! uinput-backed virtual keyboard for Linux.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use evdev::uinput::VirtualDevice;
use evdev::EventType;
use keybridge_types::{Category, CountryCode, Report};
use tracing::{debug, info};

use super::keymap;
use crate::error::HidError;
use crate::{SinkEvent, SinkObserver, VirtualHidClient};

const UINPUT_PATH: &str = "/dev/uinput";

#[derive(Default)]
struct SinkState {
    device: Option<VirtualDevice>,
    observer: Option<SinkObserver>,
    /// Last successfully posted key set, per category.
    held: [BTreeSet<u32>; Category::COUNT],
}

/// Virtual HID sink backed by a uinput device.
///
/// Reports are full snapshots; the client turns each one into the evdev
/// press/release events that move the virtual keyboard from the previous
/// snapshot of that category to the new one.
pub struct UinputClient {
    device_name: String,
    state: Mutex<SinkState>,
}

impl UinputClient {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            state: Mutex::new(SinkState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_virtual_device(&self) -> Result<VirtualDevice, HidError> {
        VirtualDevice::builder()
            .map_err(|e| HidError::VirtualDeviceCreate(e.to_string()))?
            .name(&self.device_name)
            .with_keys(&keymap::sink_keys())
            .map_err(|e| HidError::VirtualDeviceCreate(e.to_string()))?
            .build()
            .map_err(|e| HidError::VirtualDeviceCreate(e.to_string()))
    }
}

impl VirtualHidClient for UinputClient {
    fn async_start(&self, observer: SinkObserver) {
        let activated = self.driver_activated();
        observer(SinkEvent::DriverActivated(activated));

        match self.build_virtual_device() {
            Ok(device) => {
                {
                    let mut state = self.lock();
                    state.device = Some(device);
                    state.observer = Some(observer.clone());
                    state.held = Default::default();
                }
                info!(name = %self.device_name, "created virtual keyboard");
                observer(SinkEvent::DriverConnected(true));
                observer(SinkEvent::Connected);
            }
            Err(e) => {
                observer(SinkEvent::DriverConnected(false));
                observer(SinkEvent::ConnectFailed(e.to_string()));
            }
        }
    }

    fn async_initialize_keyboard(&self, country_code: CountryCode) {
        // uinput devices carry no country code; the layout comes from the
        // host keymap.
        debug!(country_code = country_code.0, "virtual keyboard initialized");
    }

    fn async_post_report(&self, report: &Report) -> Result<(), HidError> {
        let mut state = self.lock();
        let SinkState { device, held, .. } = &mut *state;
        let device = device.as_mut().ok_or(HidError::NotConnected)?;
        let previous = &mut held[report.category.index()];
        let next: BTreeSet<u32> = report.keys.iter().copied().collect();

        let mut events = Vec::new();
        for usage in previous.difference(&next) {
            push_key(&mut events, report.category, *usage, 0);
        }
        for usage in next.difference(previous) {
            push_key(&mut events, report.category, *usage, 1);
        }
        if !events.is_empty() {
            device
                .emit(&events)
                .map_err(|e| HidError::Post(e.to_string()))?;
        }
        *previous = next;
        Ok(())
    }

    fn async_stop(&self) {
        let observer = {
            let mut state = self.lock();
            if state.device.take().is_some() {
                info!(name = %self.device_name, "destroyed virtual keyboard");
            }
            state.held = Default::default();
            state.observer.take()
        };
        if let Some(observer) = observer {
            observer(SinkEvent::Closed);
        }
    }

    fn driver_activated(&self) -> bool {
        Path::new(UINPUT_PATH).exists()
    }
}

fn push_key(events: &mut Vec<evdev::InputEvent>, category: Category, usage: u32, value: i32) {
    match keymap::usage_to_evdev_key(category, usage) {
        Some(key) => events.push(evdev::InputEvent::new(EventType::KEY.0, key.0, value)),
        None => debug!(%category, usage, "no evdev key for usage"),
    }
}
