//! Output aggregator: held-key state and the virtual sink connection.
//!
//! One [`HeldKeySet`] per report [`Category`]. Every accepted event changes
//! exactly one set and posts that set's full snapshot to the sink.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use keybridge_hid::{HidError, SinkEvent, SinkObserver, VirtualHidClient};
use keybridge_types::{Category, CountryCode, KeyEvent, KeyState, Report, MAX_REPORT_KEYS};
use tracing::{debug, info, trace, warn};

use crate::error::ApplyError;

/// Usage codes currently held for one category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeldKeySet {
    keys: BTreeSet<u32>,
}

impl HeldKeySet {
    pub fn insert(&mut self, code: u32) -> bool {
        self.keys.insert(code)
    }

    pub fn remove(&mut self, code: u32) -> bool {
        self.keys.remove(&code)
    }

    pub fn contains(&self, code: u32) -> bool {
        self.keys.contains(&code)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.iter().copied()
    }

    pub fn to_report(&self, category: Category) -> Report {
        Report::new(category, self.iter())
    }
}

/// Connection state of the virtual sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ConnectPending,
    Connected,
    Closed,
    Errored,
}

#[derive(Debug, Default)]
struct Health {
    driver_activated: Option<bool>,
    driver_connected: Option<bool>,
    driver_version_mismatched: Option<bool>,
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    health: Health,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store `value` and report whether it differs from the previous one.
fn changed(slot: &mut Option<bool>, value: bool) -> bool {
    slot.replace(value) != Some(value)
}

pub struct OutputAggregator<C> {
    client: Arc<C>,
    country_code: CountryCode,
    held: [HeldKeySet; Category::COUNT],
    shared: Arc<Mutex<Shared>>,
    started: bool,
}

impl<C: VirtualHidClient> OutputAggregator<C> {
    pub fn new(client: C, country_code: CountryCode) -> Self {
        Self {
            client: Arc::new(client),
            country_code,
            held: Default::default(),
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Closed,
                health: Health::default(),
            })),
            started: false,
        }
    }

    /// Start connecting to the sink. Returns immediately; the outcome arrives
    /// through the sink's events. Does nothing while already started.
    pub fn connect(&mut self) {
        if self.started {
            return;
        }
        {
            let mut shared = lock(&self.shared);
            shared.state = ConnectionState::ConnectPending;
            shared.health = Health::default();
        }
        self.started = true;
        info!("connecting to virtual sink");
        let observer = self.observer();
        self.client.async_start(observer);
    }

    fn observer(&self) -> SinkObserver {
        let client: Weak<C> = Arc::downgrade(&self.client);
        let shared = Arc::clone(&self.shared);
        let country_code = self.country_code;
        Arc::new(move |event| {
            let initialize = handle_sink_event(&shared, event);
            if initialize {
                if let Some(client) = client.upgrade() {
                    client.async_initialize_keyboard(country_code);
                }
            }
        })
    }

    /// Apply one key transition and post the category's new state.
    pub fn apply(&mut self, event: KeyEvent) -> Result<(), ApplyError> {
        let category = Category::from_usage_page(event.page)
            .ok_or(ApplyError::UnknownCategory { page: event.page })?;
        let set = &mut self.held[category.index()];
        match event.state() {
            KeyState::Down => {
                if !set.contains(event.code) && set.len() >= MAX_REPORT_KEYS {
                    return Err(ApplyError::ReportFull { category });
                }
                set.insert(event.code);
            }
            KeyState::Up => {
                set.remove(event.code);
            }
            KeyState::Other(value) => return Err(ApplyError::InvalidValue { value }),
        }
        trace!(%event, %category, "applied");
        self.post(category);
        Ok(())
    }

    fn post(&self, category: Category) {
        let report = self.held[category.index()].to_report(category);
        match self.client.async_post_report(&report) {
            Ok(()) => {}
            Err(HidError::NotConnected) => debug!(%category, "sink not connected, report dropped"),
            Err(e) => warn!(%category, error = %e, "failed to post report"),
        }
    }

    /// Clear every held key and post an empty report for each category.
    pub fn release_all_keys(&mut self) {
        for category in Category::ALL {
            self.held[category.index()].clear();
            self.post(category);
        }
    }

    /// Clear all held keys and tear the sink connection down.
    pub fn disconnect(&mut self) {
        for category in Category::ALL {
            if !self.held[category.index()].is_empty() {
                self.held[category.index()].clear();
                if self.state() == ConnectionState::Connected {
                    self.post(category);
                }
            }
        }
        if self.started {
            self.client.async_stop();
            self.started = false;
            lock(&self.shared).state = ConnectionState::Closed;
            info!("disconnected from virtual sink");
        }
    }

    pub fn held(&self, category: Category) -> &HeldKeySet {
        &self.held[category.index()]
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    /// Whether the sink service is reachable, connected or not.
    pub fn driver_activated(&self) -> bool {
        self.client.driver_activated()
    }
}

/// Record a sink event. Returns true when the keyboard should now be
/// initialized.
fn handle_sink_event(shared: &Mutex<Shared>, event: SinkEvent) -> bool {
    let mut shared = lock(shared);
    match event {
        SinkEvent::Connected => {
            shared.state = ConnectionState::Connected;
            info!("virtual sink connected");
            true
        }
        SinkEvent::ConnectFailed(reason) => {
            shared.state = ConnectionState::Errored;
            warn!(%reason, "virtual sink connect failed");
            false
        }
        SinkEvent::Closed => {
            shared.state = ConnectionState::Closed;
            info!("virtual sink closed");
            false
        }
        SinkEvent::ErrorOccurred(reason) => {
            shared.state = ConnectionState::Errored;
            warn!(%reason, "virtual sink error");
            false
        }
        SinkEvent::DriverActivated(value) => {
            if changed(&mut shared.health.driver_activated, value) {
                info!(driver_activated = value, "driver activation changed");
            }
            false
        }
        SinkEvent::DriverConnected(value) => {
            if changed(&mut shared.health.driver_connected, value) {
                info!(driver_connected = value, "driver connection changed");
            }
            false
        }
        SinkEvent::DriverVersionMismatched(value) => {
            if changed(&mut shared.health.driver_version_mismatched, value) {
                if value {
                    warn!("driver version mismatched");
                } else {
                    info!(driver_version_mismatched = value, "driver version matches");
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use keybridge_hid::mock::{MockClient, MockClientHandle};

    use super::*;

    const KEYBOARD: u32 = 0x07;
    const CONSUMER: u32 = 0x0C;

    fn connected() -> (OutputAggregator<MockClient>, MockClientHandle) {
        let client = MockClient::new();
        let handle = client.handle();
        let mut output = OutputAggregator::new(client, CountryCode::US);
        output.connect();
        (output, handle)
    }

    #[test]
    fn connect_initializes_keyboard() {
        let (output, handle) = connected();
        assert!(handle.is_started());
        assert_eq!(output.state(), ConnectionState::Connected);
        assert_eq!(handle.keyboard_country(), Some(CountryCode::US));
    }

    #[test]
    fn connect_is_pending_until_sink_answers() {
        let client = MockClient::new();
        let handle = client.handle();
        handle.set_auto_connect(false);
        let mut output = OutputAggregator::new(client, CountryCode::US);
        output.connect();
        assert_eq!(output.state(), ConnectionState::ConnectPending);
        assert_eq!(handle.keyboard_country(), None);

        handle.emit(SinkEvent::ConnectFailed("no daemon".into()));
        assert_eq!(output.state(), ConnectionState::Errored);
        handle.emit(SinkEvent::Connected);
        assert_eq!(output.state(), ConnectionState::Connected);
        assert_eq!(handle.keyboard_country(), Some(CountryCode::US));
    }

    #[test]
    fn press_then_release_leaves_set_empty() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        output.apply(KeyEvent::up(KEYBOARD, 4)).unwrap();
        assert!(output.held(Category::Keyboard).is_empty());
        assert_eq!(
            handle.reports(),
            vec![
                Report::new(Category::Keyboard, [4]),
                Report::empty(Category::Keyboard),
            ]
        );
    }

    #[test]
    fn every_report_is_a_full_snapshot() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 5)).unwrap();
        output.apply(KeyEvent::down(KEYBOARD, 6)).unwrap();
        output.apply(KeyEvent::up(KEYBOARD, 5)).unwrap();
        assert_eq!(
            handle.last_report(Category::Keyboard),
            Some(Report::new(Category::Keyboard, [6]))
        );
        assert_eq!(handle.reports()[1], Report::new(Category::Keyboard, [5, 6]));
    }

    #[test]
    fn categories_are_independent() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        output.apply(KeyEvent::down(CONSUMER, 0xE9)).unwrap();
        assert!(output.held(Category::Keyboard).contains(4));
        assert!(output.held(Category::Consumer).contains(0xE9));
        assert_eq!(
            handle.last_report(Category::Consumer),
            Some(Report::new(Category::Consumer, [0xE9]))
        );
    }

    #[test]
    fn invalid_value_changes_nothing() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        let err = output.apply(KeyEvent::new(2, KEYBOARD, 5)).unwrap_err();
        assert_eq!(err, ApplyError::InvalidValue { value: 2 });
        assert_eq!(output.held(Category::Keyboard).len(), 1);
        assert_eq!(handle.reports().len(), 1);
    }

    #[test]
    fn unknown_page_changes_nothing() {
        let (mut output, handle) = connected();
        let err = output.apply(KeyEvent::down(0x09, 1)).unwrap_err();
        assert_eq!(err, ApplyError::UnknownCategory { page: 0x09 });
        assert_eq!(err.status(), 2);
        for category in Category::ALL {
            assert!(output.held(category).is_empty());
        }
        assert!(handle.reports().is_empty());
    }

    #[test]
    fn report_capacity_is_enforced() {
        let (mut output, _handle) = connected();
        for code in 0..u32::try_from(MAX_REPORT_KEYS).unwrap() {
            output.apply(KeyEvent::down(KEYBOARD, 0x04 + code)).unwrap();
        }
        let err = output.apply(KeyEvent::down(KEYBOARD, 0x80)).unwrap_err();
        assert_eq!(err, ApplyError::ReportFull { category: Category::Keyboard });
        // pressing an already held key is still fine
        output.apply(KeyEvent::down(KEYBOARD, 0x04)).unwrap();
        assert_eq!(output.held(Category::Keyboard).len(), MAX_REPORT_KEYS);
    }

    #[test]
    fn post_failure_keeps_state() {
        let (mut output, handle) = connected();
        handle.set_fail_post(true);
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        assert!(output.held(Category::Keyboard).contains(4));
        assert!(handle.reports().is_empty());
    }

    #[test]
    fn release_all_keys_posts_empty_reports() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        handle.clear_reports();
        output.release_all_keys();
        assert!(output.held(Category::Keyboard).is_empty());
        let reports = handle.reports();
        assert_eq!(reports.len(), Category::COUNT);
        assert!(reports.iter().all(Report::is_empty));
    }

    #[test]
    fn disconnect_clears_state_and_stops_client() {
        let (mut output, handle) = connected();
        output.apply(KeyEvent::down(KEYBOARD, 4)).unwrap();
        output.disconnect();
        assert!(output.held(Category::Keyboard).is_empty());
        assert!(handle.is_stopped());
        assert_eq!(output.state(), ConnectionState::Closed);
        assert_eq!(
            handle.last_report(Category::Keyboard),
            Some(Report::empty(Category::Keyboard))
        );
        output.disconnect();
    }

    #[test]
    fn health_signals_are_deduplicated() {
        let shared = Mutex::new(Shared {
            state: ConnectionState::Closed,
            health: Health::default(),
        });
        handle_sink_event(&shared, SinkEvent::DriverActivated(true));
        assert_eq!(lock(&shared).health.driver_activated, Some(true));
        let mut slot = Some(true);
        assert!(!changed(&mut slot, true));
        assert!(changed(&mut slot, false));
        assert!(changed(&mut None, false));
    }

    #[test]
    fn observer_does_not_keep_client_alive() {
        let (output, handle) = connected();
        drop(output);
        handle.emit(SinkEvent::Connected);
    }
}
