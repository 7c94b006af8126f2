//! Mapping between HID usages and evdev key codes.
//!
//! Captured evdev keys are reported as `(usage page, usage)` pairs so that
//! they look the same as on any other platform; reports to the uinput sink go
//! the other way.

use evdev::{AttributeSet, KeyCode as EvdevKey};
use keybridge_types::{Category, UsagePage};

/// Keyboard/keypad page (0x07).
const KEYBOARD: &[(u32, EvdevKey)] = &[
    (0x04, EvdevKey::KEY_A),
    (0x05, EvdevKey::KEY_B),
    (0x06, EvdevKey::KEY_C),
    (0x07, EvdevKey::KEY_D),
    (0x08, EvdevKey::KEY_E),
    (0x09, EvdevKey::KEY_F),
    (0x0A, EvdevKey::KEY_G),
    (0x0B, EvdevKey::KEY_H),
    (0x0C, EvdevKey::KEY_I),
    (0x0D, EvdevKey::KEY_J),
    (0x0E, EvdevKey::KEY_K),
    (0x0F, EvdevKey::KEY_L),
    (0x10, EvdevKey::KEY_M),
    (0x11, EvdevKey::KEY_N),
    (0x12, EvdevKey::KEY_O),
    (0x13, EvdevKey::KEY_P),
    (0x14, EvdevKey::KEY_Q),
    (0x15, EvdevKey::KEY_R),
    (0x16, EvdevKey::KEY_S),
    (0x17, EvdevKey::KEY_T),
    (0x18, EvdevKey::KEY_U),
    (0x19, EvdevKey::KEY_V),
    (0x1A, EvdevKey::KEY_W),
    (0x1B, EvdevKey::KEY_X),
    (0x1C, EvdevKey::KEY_Y),
    (0x1D, EvdevKey::KEY_Z),
    (0x1E, EvdevKey::KEY_1),
    (0x1F, EvdevKey::KEY_2),
    (0x20, EvdevKey::KEY_3),
    (0x21, EvdevKey::KEY_4),
    (0x22, EvdevKey::KEY_5),
    (0x23, EvdevKey::KEY_6),
    (0x24, EvdevKey::KEY_7),
    (0x25, EvdevKey::KEY_8),
    (0x26, EvdevKey::KEY_9),
    (0x27, EvdevKey::KEY_0),
    (0x28, EvdevKey::KEY_ENTER),
    (0x29, EvdevKey::KEY_ESC),
    (0x2A, EvdevKey::KEY_BACKSPACE),
    (0x2B, EvdevKey::KEY_TAB),
    (0x2C, EvdevKey::KEY_SPACE),
    (0x2D, EvdevKey::KEY_MINUS),
    (0x2E, EvdevKey::KEY_EQUAL),
    (0x2F, EvdevKey::KEY_LEFTBRACE),
    (0x30, EvdevKey::KEY_RIGHTBRACE),
    (0x31, EvdevKey::KEY_BACKSLASH),
    (0x33, EvdevKey::KEY_SEMICOLON),
    (0x34, EvdevKey::KEY_APOSTROPHE),
    (0x35, EvdevKey::KEY_GRAVE),
    (0x36, EvdevKey::KEY_COMMA),
    (0x37, EvdevKey::KEY_DOT),
    (0x38, EvdevKey::KEY_SLASH),
    (0x39, EvdevKey::KEY_CAPSLOCK),
    (0x3A, EvdevKey::KEY_F1),
    (0x3B, EvdevKey::KEY_F2),
    (0x3C, EvdevKey::KEY_F3),
    (0x3D, EvdevKey::KEY_F4),
    (0x3E, EvdevKey::KEY_F5),
    (0x3F, EvdevKey::KEY_F6),
    (0x40, EvdevKey::KEY_F7),
    (0x41, EvdevKey::KEY_F8),
    (0x42, EvdevKey::KEY_F9),
    (0x43, EvdevKey::KEY_F10),
    (0x44, EvdevKey::KEY_F11),
    (0x45, EvdevKey::KEY_F12),
    (0x46, EvdevKey::KEY_SYSRQ),
    (0x47, EvdevKey::KEY_SCROLLLOCK),
    (0x48, EvdevKey::KEY_PAUSE),
    (0x49, EvdevKey::KEY_INSERT),
    (0x4A, EvdevKey::KEY_HOME),
    (0x4B, EvdevKey::KEY_PAGEUP),
    (0x4C, EvdevKey::KEY_DELETE),
    (0x4D, EvdevKey::KEY_END),
    (0x4E, EvdevKey::KEY_PAGEDOWN),
    (0x4F, EvdevKey::KEY_RIGHT),
    (0x50, EvdevKey::KEY_LEFT),
    (0x51, EvdevKey::KEY_DOWN),
    (0x52, EvdevKey::KEY_UP),
    (0x53, EvdevKey::KEY_NUMLOCK),
    (0x54, EvdevKey::KEY_KPSLASH),
    (0x55, EvdevKey::KEY_KPASTERISK),
    (0x56, EvdevKey::KEY_KPMINUS),
    (0x57, EvdevKey::KEY_KPPLUS),
    (0x58, EvdevKey::KEY_KPENTER),
    (0x59, EvdevKey::KEY_KP1),
    (0x5A, EvdevKey::KEY_KP2),
    (0x5B, EvdevKey::KEY_KP3),
    (0x5C, EvdevKey::KEY_KP4),
    (0x5D, EvdevKey::KEY_KP5),
    (0x5E, EvdevKey::KEY_KP6),
    (0x5F, EvdevKey::KEY_KP7),
    (0x60, EvdevKey::KEY_KP8),
    (0x61, EvdevKey::KEY_KP9),
    (0x62, EvdevKey::KEY_KP0),
    (0x63, EvdevKey::KEY_KPDOT),
    (0x64, EvdevKey::KEY_102ND),
    (0x65, EvdevKey::KEY_COMPOSE),
    (0x67, EvdevKey::KEY_KPEQUAL),
    (0x68, EvdevKey::KEY_F13),
    (0x69, EvdevKey::KEY_F14),
    (0x6A, EvdevKey::KEY_F15),
    (0x6B, EvdevKey::KEY_F16),
    (0x6C, EvdevKey::KEY_F17),
    (0x6D, EvdevKey::KEY_F18),
    (0x6E, EvdevKey::KEY_F19),
    (0x6F, EvdevKey::KEY_F20),
    (0x70, EvdevKey::KEY_F21),
    (0x71, EvdevKey::KEY_F22),
    (0x72, EvdevKey::KEY_F23),
    (0x73, EvdevKey::KEY_F24),
    (0x87, EvdevKey::KEY_RO),
    (0x88, EvdevKey::KEY_KATAKANAHIRAGANA),
    (0x89, EvdevKey::KEY_YEN),
    (0x8A, EvdevKey::KEY_HENKAN),
    (0x8B, EvdevKey::KEY_MUHENKAN),
    (0x90, EvdevKey::KEY_HANGEUL),
    (0x91, EvdevKey::KEY_HANJA),
    (0xE0, EvdevKey::KEY_LEFTCTRL),
    (0xE1, EvdevKey::KEY_LEFTSHIFT),
    (0xE2, EvdevKey::KEY_LEFTALT),
    (0xE3, EvdevKey::KEY_LEFTMETA),
    (0xE4, EvdevKey::KEY_RIGHTCTRL),
    (0xE5, EvdevKey::KEY_RIGHTSHIFT),
    (0xE6, EvdevKey::KEY_RIGHTALT),
    (0xE7, EvdevKey::KEY_RIGHTMETA),
];

/// Consumer page (0x0C).
const CONSUMER: &[(u32, EvdevKey)] = &[
    (0x6F, EvdevKey::KEY_BRIGHTNESSUP),
    (0x70, EvdevKey::KEY_BRIGHTNESSDOWN),
    (0xB5, EvdevKey::KEY_NEXTSONG),
    (0xB6, EvdevKey::KEY_PREVIOUSSONG),
    (0xB7, EvdevKey::KEY_STOPCD),
    (0xB8, EvdevKey::KEY_EJECTCD),
    (0xCD, EvdevKey::KEY_PLAYPAUSE),
    (0xE2, EvdevKey::KEY_MUTE),
    (0xE9, EvdevKey::KEY_VOLUMEUP),
    (0xEA, EvdevKey::KEY_VOLUMEDOWN),
    (0x192, EvdevKey::KEY_CALC),
    (0x221, EvdevKey::KEY_SEARCH),
    (0x223, EvdevKey::KEY_HOMEPAGE),
];

/// Apple vendor top case page (0x00FF).
const APPLE_TOP_CASE: &[(u32, EvdevKey)] = &[
    (0x03, EvdevKey::KEY_FN),
    (0x07, EvdevKey::KEY_KBDILLUMTOGGLE),
    (0x08, EvdevKey::KEY_KBDILLUMUP),
    (0x09, EvdevKey::KEY_KBDILLUMDOWN),
];

/// Apple vendor keyboard page (0xFF01).
const APPLE_KEYBOARD: &[(u32, EvdevKey)] = &[
    (0x02, EvdevKey::KEY_DASHBOARD),
    (0x10, EvdevKey::KEY_SCALE),
];

/// Generic desktop page (0x01), system controls only.
const GENERIC_DESKTOP: &[(u32, EvdevKey)] = &[
    (0x81, EvdevKey::KEY_POWER),
    (0x82, EvdevKey::KEY_SLEEP),
    (0x83, EvdevKey::KEY_WAKEUP),
];

fn table(category: Category) -> &'static [(u32, EvdevKey)] {
    match category {
        Category::Keyboard => KEYBOARD,
        Category::Consumer => CONSUMER,
        Category::AppleVendorTopCase => APPLE_TOP_CASE,
        Category::AppleVendorKeyboard => APPLE_KEYBOARD,
        Category::GenericDesktop => GENERIC_DESKTOP,
    }
}

// Media keys are checked before the keyboard page so they route to the
// consumer report.
const LOOKUP_ORDER: [Category; Category::COUNT] = [
    Category::Consumer,
    Category::GenericDesktop,
    Category::AppleVendorTopCase,
    Category::AppleVendorKeyboard,
    Category::Keyboard,
];

/// Convert an evdev key to its `(usage page, usage)` pair, if mapped.
pub fn evdev_key_to_usage(key: EvdevKey) -> Option<(UsagePage, u32)> {
    LOOKUP_ORDER.iter().find_map(|&category| {
        table(category)
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(usage, _)| (category.usage_page(), *usage))
    })
}

/// Convert a usage within `category` to the evdev key the sink emits.
pub fn usage_to_evdev_key(category: Category, usage: u32) -> Option<EvdevKey> {
    table(category)
        .iter()
        .find(|(u, _)| *u == usage)
        .map(|(_, key)| *key)
}

/// Every evdev key the virtual keyboard can emit.
pub fn sink_keys() -> AttributeSet<EvdevKey> {
    let mut keys = AttributeSet::<EvdevKey>::new();
    for category in Category::ALL {
        for (_, key) in table(category) {
            keys.insert(*key);
        }
    }
    keys
}

/// Convert an evdev key value to a key event value. Autorepeat (2) is not a
/// transition and yields `None`.
pub fn evdev_value_to_key_value(value: i32) -> Option<u64> {
    match value {
        0 => Some(0),
        1 => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_mapped_usages() {
        for category in Category::ALL {
            for &(usage, key) in table(category) {
                assert_eq!(usage_to_evdev_key(category, usage), Some(key));
                assert_eq!(
                    evdev_key_to_usage(key),
                    Some((category.usage_page(), usage)),
                    "round-trip failed for {key:?}"
                );
            }
        }
    }

    #[test]
    fn letters_and_modifiers() {
        assert_eq!(
            evdev_key_to_usage(EvdevKey::KEY_A),
            Some((UsagePage::KEYBOARD_OR_KEYPAD, 0x04))
        );
        assert_eq!(
            evdev_key_to_usage(EvdevKey::KEY_RIGHTMETA),
            Some((UsagePage::KEYBOARD_OR_KEYPAD, 0xE7))
        );
        assert_eq!(
            usage_to_evdev_key(Category::Keyboard, 0x27),
            Some(EvdevKey::KEY_0)
        );
    }

    #[test]
    fn media_keys_route_to_consumer() {
        assert_eq!(
            evdev_key_to_usage(EvdevKey::KEY_MUTE),
            Some((UsagePage::CONSUMER, 0xE2))
        );
        assert_eq!(
            evdev_key_to_usage(EvdevKey::KEY_PLAYPAUSE),
            Some((UsagePage::CONSUMER, 0xCD))
        );
    }

    #[test]
    fn unmapped_keys_return_none() {
        assert_eq!(evdev_key_to_usage(EvdevKey::BTN_LEFT), None);
        assert_eq!(usage_to_evdev_key(Category::Keyboard, 0x01), None);
        assert_eq!(usage_to_evdev_key(Category::GenericDesktop, 0x30), None);
    }

    #[test]
    fn sink_keys_cover_every_table() {
        let keys = sink_keys();
        assert!(keys.contains(EvdevKey::KEY_A));
        assert!(keys.contains(EvdevKey::KEY_VOLUMEUP));
        assert!(keys.contains(EvdevKey::KEY_FN));
        assert!(keys.contains(EvdevKey::KEY_POWER));
    }

    #[test]
    fn key_value_conversion() {
        assert_eq!(evdev_value_to_key_value(0), Some(0));
        assert_eq!(evdev_value_to_key_value(1), Some(1));
        assert_eq!(evdev_value_to_key_value(2), None);
        assert_eq!(evdev_value_to_key_value(-1), None);
    }
}
