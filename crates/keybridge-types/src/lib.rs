//! Shared types for keybridge.
//!
//! This crate contains the types shared across the keybridge workspace:
//! device identity hashing, the normalized key event, HID usage pages and
//! report categories, device descriptors, and virtual sink reports.

pub mod device;
pub mod event;
pub mod identity;
pub mod report;
pub mod usage;

pub use device::{DeviceFilter, DeviceInfo, DeviceLocator, PresentDevice};
pub use event::{KeyEvent, KeyState};
pub use identity::{compute_identity_hash, DeviceIdentity, IdentityHash, ParseIdentityError};
pub use report::{CountryCode, Report, MAX_REPORT_KEYS};
pub use usage::{Category, UsagePage};
