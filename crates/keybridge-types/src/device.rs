//! Device descriptor types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{compute_identity_hash, IdentityHash};

/// Describes a keyboard-class device present on the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Product name as reported by the OS (e.g. "Apple Internal Keyboard").
    pub name: String,
    pub vendor_id: u32,
    pub product_id: u32,
    /// Identity hash recomputed from the three fields above.
    pub identity: IdentityHash,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, vendor_id: u32, product_id: u32) -> Self {
        let name = name.into();
        let identity = compute_identity_hash(vendor_id, product_id, &name);
        Self {
            name,
            vendor_id,
            product_id,
            identity,
        }
    }
}

/// Opaque OS-side locator of one enumeration of a device (a device node,
/// a registry entry id). Not stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceLocator(pub String);

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device found by enumeration: what it is and where the OS has it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentDevice {
    pub info: DeviceInfo,
    pub locator: DeviceLocator,
}

impl PresentDevice {
    pub fn identity(&self) -> IdentityHash {
        self.info.identity
    }
}

/// Which present devices a registration (or a notification subscription)
/// applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFilter {
    /// Every keyboard-class device.
    All,
    /// Devices whose product name is exactly this string.
    Name(String),
    /// The device whose recomputed identity hash equals this one.
    Identity(IdentityHash),
}

impl DeviceFilter {
    /// `None` or an empty name means every device.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() => Self::Name(name.to_string()),
            _ => Self::All,
        }
    }

    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            Self::All => true,
            Self::Name(name) => info.name == *name,
            Self::Identity(hash) => info.identity == *hash,
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all devices"),
            Self::Name(name) => write!(f, "name {name:?}"),
            Self::Identity(hash) => write!(f, "identity {hash}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_computes_identity() {
        let info = DeviceInfo::new("USB Keyboard", 0x046d, 0xc31c);
        assert_eq!(
            info.identity,
            compute_identity_hash(0x046d, 0xc31c, "USB Keyboard")
        );
    }

    #[test]
    fn filter_matching() {
        let info = DeviceInfo::new("USB Keyboard", 1, 2);
        assert!(DeviceFilter::All.matches(&info));
        assert!(DeviceFilter::Name("USB Keyboard".into()).matches(&info));
        assert!(!DeviceFilter::Name("USB".into()).matches(&info));
        assert!(DeviceFilter::Identity(info.identity).matches(&info));
        assert!(!DeviceFilter::Identity(IdentityHash(0)).matches(&info));
    }

    #[test]
    fn empty_name_means_all() {
        assert_eq!(DeviceFilter::from_name(None), DeviceFilter::All);
        assert_eq!(DeviceFilter::from_name(Some("")), DeviceFilter::All);
        assert_eq!(
            DeviceFilter::from_name(Some("Keyboard")),
            DeviceFilter::Name("Keyboard".into())
        );
    }

    #[test]
    fn device_info_serde_roundtrip() {
        let info = DeviceInfo::new("Test Keyboard", 7, 9);
        let json = serde_json::to_string(&info).unwrap();
        let decoded: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, decoded);
    }
}
