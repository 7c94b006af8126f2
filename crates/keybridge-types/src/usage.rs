//! HID usage pages and output report categories.

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A HID usage page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsagePage(pub u32);

impl UsagePage {
    pub const GENERIC_DESKTOP: Self = Self(0x01);
    pub const KEYBOARD_OR_KEYPAD: Self = Self(0x07);
    pub const CONSUMER: Self = Self(0x0C);
    pub const APPLE_VENDOR_TOP_CASE: Self = Self(0x00FF);
    pub const APPLE_VENDOR_KEYBOARD: Self = Self(0xFF01);
}

impl fmt::Display for UsagePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Output report category. Each category has its own held-key set and its
/// own report on the virtual sink.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
pub enum Category {
    Keyboard,
    Consumer,
    AppleVendorTopCase,
    AppleVendorKeyboard,
    GenericDesktop,
}

impl Category {
    pub const COUNT: usize = 5;

    pub const ALL: [Category; Self::COUNT] = [
        Category::Keyboard,
        Category::Consumer,
        Category::AppleVendorTopCase,
        Category::AppleVendorKeyboard,
        Category::GenericDesktop,
    ];

    /// Route a usage page to its category, `None` for pages with no report.
    pub fn from_usage_page(page: u32) -> Option<Self> {
        match UsagePage(page) {
            UsagePage::KEYBOARD_OR_KEYPAD => Some(Self::Keyboard),
            UsagePage::CONSUMER => Some(Self::Consumer),
            UsagePage::APPLE_VENDOR_TOP_CASE => Some(Self::AppleVendorTopCase),
            UsagePage::APPLE_VENDOR_KEYBOARD => Some(Self::AppleVendorKeyboard),
            UsagePage::GENERIC_DESKTOP => Some(Self::GenericDesktop),
            _ => None,
        }
    }

    pub fn usage_page(self) -> UsagePage {
        match self {
            Self::Keyboard => UsagePage::KEYBOARD_OR_KEYPAD,
            Self::Consumer => UsagePage::CONSUMER,
            Self::AppleVendorTopCase => UsagePage::APPLE_VENDOR_TOP_CASE,
            Self::AppleVendorKeyboard => UsagePage::APPLE_VENDOR_KEYBOARD,
            Self::GenericDesktop => UsagePage::GENERIC_DESKTOP,
        }
    }

    /// Position in [`Category::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Keyboard => 0,
            Self::Consumer => 1,
            Self::AppleVendorTopCase => 2,
            Self::AppleVendorKeyboard => 3,
            Self::GenericDesktop => 4,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyboard => write!(f, "keyboard"),
            Self::Consumer => write!(f, "consumer"),
            Self::AppleVendorTopCase => write!(f, "apple_vendor_top_case"),
            Self::AppleVendorKeyboard => write!(f, "apple_vendor_keyboard"),
            Self::GenericDesktop => write!(f, "generic_desktop"),
        }
    }
}
