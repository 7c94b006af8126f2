//! The capture session: one object tying the registry, the listener loop,
//! the event channel and the output aggregator together.
//!
//! Every method takes `&self`, so a session can live in a `static` and be
//! driven from several caller threads: typically one thread blocked in
//! [`Session::wait_key`] and another calling [`Session::send_key`]. Device
//! handles never leave the listener loop thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keybridge_hid::{HidPlatform, VirtualHidClient};
use keybridge_types::{Category, DeviceFilter, DeviceInfo, IdentityHash, KeyEvent};
use tracing::{debug, info, warn};

use crate::channel::{event_channel, EventReader, Received};
use crate::config::Config;
use crate::error::{ApplyError, EngineError};
use crate::listener::{ListenerLoop, ListenerOptions};
use crate::output::{ConnectionState, OutputAggregator};
use crate::registry::DeviceRegistry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Control<P> {
    registry: DeviceRegistry<P>,
    listener: Option<ListenerLoop>,
}

pub struct Session<P, C> {
    platform: Arc<P>,
    listener_options: ListenerOptions,
    channel_capacity: usize,
    control: Mutex<Control<P>>,
    reader: Mutex<Option<EventReader>>,
    output: Mutex<OutputAggregator<C>>,
}

impl<P: HidPlatform, C: VirtualHidClient> Session<P, C> {
    pub fn new(platform: P, client: C, config: &Config) -> Self {
        let platform = Arc::new(platform);
        let exclusion = config.capture.exclusion_policy();
        Self {
            listener_options: ListenerOptions {
                exclusion: exclusion.clone(),
                adopt_new_devices: config.capture.adopt_new_devices,
            },
            channel_capacity: config.capture.channel_capacity,
            control: Mutex::new(Control {
                registry: DeviceRegistry::new(Arc::clone(&platform), exclusion),
                listener: None,
            }),
            reader: Mutex::new(None),
            output: Mutex::new(OutputAggregator::new(client, config.sink.country_code)),
            platform,
        }
    }

    /// Register present devices matching `filter`. Returns true iff at least
    /// one device matched. While grabbed, matched devices are captured right
    /// away.
    pub fn register(&self, filter: &DeviceFilter) -> bool {
        let mut control = lock(&self.control);
        let matched = control.registry.register_matching(filter);
        if matched.is_empty() {
            return false;
        }
        if let Some(handle) = control.listener.as_ref().and_then(ListenerLoop::handle) {
            if let Err(e) = handle.register(filter.clone()) {
                warn!(error = %e, "failed to post registration to listener");
            }
        }
        true
    }

    /// Start capturing: create the event channel, start the listener loop,
    /// capture every present registered device and connect the sink.
    ///
    /// Fails with [`EngineError::NothingRegistered`] and no side effects if
    /// nothing is registered.
    pub fn grab(&self) -> Result<(), EngineError> {
        let mut control = lock(&self.control);
        if control.registry.is_empty() {
            return Err(EngineError::NothingRegistered);
        }
        if control.listener.is_some() {
            return Err(EngineError::AlreadyGrabbed);
        }

        let (writer, reader) = event_channel(self.channel_capacity);
        let mut listener = ListenerLoop::spawn(
            Arc::clone(&self.platform),
            control.registry.shared(),
            writer,
            self.listener_options.clone(),
        )?;
        let handle = listener.wait_initialized()?;
        for scope in control.registry.scopes() {
            handle.register(scope.clone())?;
        }
        listener.run()?;
        // Answered only after the queued registrations are handled, so every
        // present registered device is captured once this returns.
        let open = handle.open_devices()?;

        *lock(&self.reader) = Some(reader);
        control.listener = Some(listener);
        lock(&self.output).connect();
        info!(registered = control.registry.len(), open = open.len(), "grabbed");
        Ok(())
    }

    /// Block until the next captured key event. Returns `None` when not
    /// grabbed or once the session is released.
    ///
    /// Events lost to a full channel are never replayed: every held key is
    /// released as soon as the loss is observed, before any later event is
    /// returned.
    pub fn wait_key(&self) -> Option<KeyEvent> {
        let mut guard = lock(&self.reader);
        let reader = guard.as_mut()?;
        loop {
            match reader.receive() {
                Ok(Received::Event(event)) => return Some(event),
                Ok(Received::Gap { dropped }) => {
                    warn!(dropped, "event channel overflowed, releasing all held keys");
                    lock(&self.output).release_all_keys();
                }
                Err(e) => {
                    debug!(error = %e, "event channel ended");
                    return None;
                }
            }
        }
    }

    /// Apply `event` to the held-key state and post it to the sink.
    pub fn send_key(&self, event: &KeyEvent) -> Result<(), ApplyError> {
        lock(&self.output).apply(*event)
    }

    /// Stop the listener loop, release every captured device, close the
    /// channel, clear held keys, disconnect the sink and forget all
    /// registrations. Idempotent.
    pub fn release(&self) {
        let mut control = lock(&self.control);
        if let Some(mut listener) = control.listener.take() {
            // Joining drops the last writer, which unblocks `wait_key`.
            listener.stop();
            info!("released");
        }
        lock(&self.reader).take();
        lock(&self.output).disconnect();
        control.registry.clear();
    }

    pub fn is_grabbed(&self) -> bool {
        lock(&self.control).listener.is_some()
    }

    pub fn is_registered(&self, hash: IdentityHash) -> bool {
        lock(&self.control).registry.is_registered(hash)
    }

    /// Every present keyboard-class device.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        lock(&self.control).registry.list_present_devices().collect()
    }

    pub fn device_matches(&self, name: &str) -> bool {
        lock(&self.control).registry.device_matches(name)
    }

    /// Identities currently held open by the listener loop.
    pub fn open_devices(&self) -> Vec<IdentityHash> {
        let control = lock(&self.control);
        control
            .listener
            .as_ref()
            .and_then(ListenerLoop::handle)
            .map(|handle| handle.open_devices().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn held_keys(&self, category: Category) -> Vec<u32> {
        lock(&self.output).held(category).iter().collect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.output).state()
    }

    /// Whether the virtual sink service is reachable at all.
    pub fn driver_activated(&self) -> bool {
        lock(&self.output).driver_activated()
    }
}
