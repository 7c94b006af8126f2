//! The device registry: which identities the caller wants captured.
//!
//! Registration always matches against a fresh enumeration by recomputed
//! identity hash, never against a cached OS handle, so a registered device is
//! recognized again after it is unplugged and reconnected.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keybridge_hid::HidPlatform;
use keybridge_types::{DeviceFilter, DeviceInfo, IdentityHash};
use tracing::{debug, info, warn};

/// Identity hashes the caller asked to capture.
pub type RegisteredSet = BTreeSet<IdentityHash>;

/// The one [`RegisteredSet`] of a session, shared between the registry on
/// the caller side and the capture manager on the listener loop. Devices
/// adopted on arrival land here too.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistered(Arc<Mutex<RegisteredSet>>);

impl SharedRegistered {
    fn lock(&self) -> MutexGuard<'_, RegisteredSet> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if `hash` was not registered yet.
    pub fn insert(&self, hash: IdentityHash) -> bool {
        self.lock().insert(hash)
    }

    pub fn extend(&self, hashes: impl IntoIterator<Item = IdentityHash>) {
        self.lock().extend(hashes);
    }

    pub fn contains(&self, hash: IdentityHash) -> bool {
        self.lock().contains(&hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> RegisteredSet {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Name-substring predicate keeping the loopback virtual keyboard (and
/// anything else listed) out of capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionPolicy {
    substrings: Vec<String>,
}

impl ExclusionPolicy {
    /// Empty substrings are ignored.
    pub fn new(substrings: Vec<String>) -> Self {
        Self {
            substrings: substrings.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.substrings.iter().any(|s| name.contains(s.as_str()))
    }
}

pub struct DeviceRegistry<P> {
    platform: Arc<P>,
    exclusion: ExclusionPolicy,
    registered: SharedRegistered,
    /// Filters that matched at least one device, in registration order.
    scopes: Vec<DeviceFilter>,
}

impl<P: HidPlatform> DeviceRegistry<P> {
    pub fn new(platform: Arc<P>, exclusion: ExclusionPolicy) -> Self {
        Self {
            platform,
            exclusion,
            registered: SharedRegistered::default(),
            scopes: Vec::new(),
        }
    }

    /// Register every present, non-excluded device matching `filter`.
    /// Returns true iff at least one device matched, including devices that
    /// were already registered.
    pub fn register(&mut self, filter: &DeviceFilter) -> bool {
        !self.register_matching(filter).is_empty()
    }

    /// Like [`DeviceRegistry::register`], returning the matched hashes.
    pub fn register_matching(&mut self, filter: &DeviceFilter) -> Vec<IdentityHash> {
        let present = match self.platform.enumerate() {
            Ok(present) => present,
            Err(e) => {
                warn!(error = %e, "device enumeration failed");
                return Vec::new();
            }
        };

        let mut matched = Vec::new();
        for device in present {
            if self.exclusion.is_excluded(&device.info.name) {
                debug!(device = %device.info.name, "excluded from registration");
                continue;
            }
            if !filter.matches(&device.info) {
                continue;
            }
            let hash = device.identity();
            if self.registered.insert(hash) {
                info!(device = %device.info.name, identity = %hash, "registered device");
            }
            if !matched.contains(&hash) {
                matched.push(hash);
            }
        }

        if matched.is_empty() {
            debug!(%filter, "no device matched registration");
        } else if !self.scopes.contains(filter) {
            self.scopes.push(filter.clone());
        }
        matched
    }

    pub fn is_registered(&self, hash: IdentityHash) -> bool {
        self.registered.contains(hash)
    }

    /// Snapshot of the registered identities.
    pub fn registered(&self) -> RegisteredSet {
        self.registered.snapshot()
    }

    /// Handle on the live set, for the listener loop.
    pub fn shared(&self) -> SharedRegistered {
        self.registered.clone()
    }

    pub fn scopes(&self) -> &[DeviceFilter] {
        &self.scopes
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn exclusion(&self) -> &ExclusionPolicy {
        &self.exclusion
    }

    /// Snapshot of every present keyboard-class device, excluded ones
    /// included. Enumeration happens once, when this is called.
    pub fn list_present_devices(&self) -> impl Iterator<Item = DeviceInfo> {
        let present = self.platform.enumerate().unwrap_or_else(|e| {
            warn!(error = %e, "device enumeration failed");
            Vec::new()
        });
        present.into_iter().map(|d| d.info)
    }

    /// True iff a present device has exactly this name. An empty name
    /// matches any present device.
    pub fn device_matches(&self, name: &str) -> bool {
        let filter = DeviceFilter::from_name(Some(name));
        self.list_present_devices().any(|info| filter.matches(&info))
    }

    pub fn clear(&mut self) {
        self.registered.clear();
        self.scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use keybridge_hid::mock::MockPlatform;

    use super::*;

    fn registry() -> (DeviceRegistry<MockPlatform>, keybridge_hid::mock::MockPlatformHandle) {
        let (platform, handle) = MockPlatform::new();
        let policy = ExclusionPolicy::new(vec!["Karabiner".into()]);
        (DeviceRegistry::new(Arc::new(platform), policy), handle)
    }

    #[test]
    fn register_all_skips_loopback_device() {
        let (mut registry, handle) = registry();
        let a = handle.add_device("USB Keyboard", 0x046d, 0xc31c);
        let b = handle.add_device("Apple Internal Keyboard", 0x05ac, 0x0342);
        let loopback = handle.add_device("Karabiner DriverKit VirtualHIDKeyboard", 0x16c0, 0x27db);

        assert!(registry.register(&DeviceFilter::All));
        assert_eq!(registry.registered().len(), 2);
        assert!(registry.is_registered(a.identity()));
        assert!(registry.is_registered(b.identity()));
        assert!(!registry.is_registered(loopback.identity()));
    }

    #[test]
    fn register_by_name_is_exact() {
        let (mut registry, handle) = registry();
        let wanted = handle.add_device("USB Keyboard", 1, 2);
        handle.add_device("USB Keyboard Pro", 1, 3);

        assert!(registry.register(&DeviceFilter::Name("USB Keyboard".into())));
        assert_eq!(registry.registered().len(), 1);
        assert!(registry.is_registered(wanted.identity()));
        assert!(!registry.register(&DeviceFilter::Name("USB".into())));
    }

    #[test]
    fn register_by_hash_requires_present_device() {
        let (mut registry, handle) = registry();
        let device = handle.add_device("USB Keyboard", 1, 2);

        assert!(!registry.register(&DeviceFilter::Identity(IdentityHash(42))));
        assert!(registry.is_empty());
        assert!(registry.register(&DeviceFilter::Identity(device.identity())));
        assert!(registry.is_registered(device.identity()));
    }

    #[test]
    fn registering_twice_is_idempotent() {
        let (mut registry, handle) = registry();
        let device = handle.add_device("USB Keyboard", 1, 2);
        let filter = DeviceFilter::Identity(device.identity());

        assert!(registry.register(&filter));
        let once = registry.registered();
        assert!(registry.register(&filter));
        assert_eq!(registry.registered(), once);
        assert_eq!(registry.scopes(), &[filter]);
    }

    #[test]
    fn identical_devices_share_one_entry() {
        let (mut registry, handle) = registry();
        handle.add_device("USB Keyboard", 1, 2);
        handle.add_device("USB Keyboard", 1, 2);
        assert_eq!(registry.register_matching(&DeviceFilter::All).len(), 1);
    }

    #[test]
    fn registration_survives_unplug() {
        let (mut registry, handle) = registry();
        let device = handle.add_device("USB Keyboard", 1, 2);
        registry.register(&DeviceFilter::All);
        handle.unplug(&device.locator);
        assert!(registry.is_registered(device.identity()));
    }

    #[test]
    fn device_listing_and_matching() {
        let (registry, handle) = registry();
        handle.add_device("USB Keyboard", 1, 2);
        handle.add_device("Karabiner VirtualHIDKeyboard", 3, 4);

        let names: Vec<String> = registry.list_present_devices().map(|d| d.name).collect();
        assert_eq!(names, vec!["USB Keyboard", "Karabiner VirtualHIDKeyboard"]);
        assert!(registry.device_matches("USB Keyboard"));
        assert!(registry.device_matches(""));
        assert!(!registry.device_matches("Missing"));
    }

    #[test]
    fn clear_empties_registry() {
        let (mut registry, handle) = registry();
        handle.add_device("USB Keyboard", 1, 2);
        registry.register(&DeviceFilter::All);
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.scopes().is_empty());
    }

    #[test]
    fn shared_set_sees_inserts_from_either_side() {
        let (mut registry, handle) = registry();
        let device = handle.add_device("USB Keyboard", 1, 2);
        registry.register(&DeviceFilter::All);

        let shared = registry.shared();
        assert!(shared.contains(device.identity()));
        assert!(shared.insert(IdentityHash(7)));
        assert!(registry.is_registered(IdentityHash(7)));
        assert_eq!(registry.registered().len(), 2);

        registry.clear();
        assert!(shared.is_empty());
    }

    #[test]
    fn empty_exclusion_substrings_are_ignored() {
        let policy = ExclusionPolicy::new(vec![String::new()]);
        assert!(!policy.is_excluded("USB Keyboard"));
    }
}
