//! The normalized key event.
//!
//! One [`KeyEvent`] is produced per physical value change on a captured
//! device. The layout is `#[repr(C)]` so the same struct crosses the C
//! boundary unchanged.

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A single key state transition.
///
/// `value` is 0 for key up, 1 for key down; anything else is not a key
/// transition and is rejected by the output side.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct KeyEvent {
    pub value: u64,
    pub page: u32,
    pub code: u32,
}

/// Interpretation of [`KeyEvent::value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    Up,
    Down,
    /// Any value other than 0 or 1.
    Other(u64),
}

impl KeyEvent {
    /// Size of one event record on the wire: `u64 + u32 + u32`.
    pub const RECORD_SIZE: usize = 16;

    pub fn new(value: u64, page: u32, code: u32) -> Self {
        Self { value, page, code }
    }

    /// Key-down event for `code` on `page`.
    pub fn down(page: u32, code: u32) -> Self {
        Self::new(1, page, code)
    }

    /// Key-up event for `code` on `page`.
    pub fn up(page: u32, code: u32) -> Self {
        Self::new(0, page, code)
    }

    pub fn state(&self) -> KeyState {
        match self.value {
            0 => KeyState::Up,
            1 => KeyState::Down,
            other => KeyState::Other(other),
        }
    }
}

impl fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event: {{ type: {:#x}, page: {:#x}, code: {:#x} }}",
            self.value, self.page, self.code
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<KeyEvent>(), KeyEvent::RECORD_SIZE);
        assert_eq!(std::mem::align_of::<KeyEvent>(), 8);
    }

    #[test]
    fn state_from_value() {
        assert_eq!(KeyEvent::down(7, 4).state(), KeyState::Down);
        assert_eq!(KeyEvent::up(7, 4).state(), KeyState::Up);
        assert_eq!(KeyEvent::new(2, 7, 4).state(), KeyState::Other(2));
    }

    #[test]
    fn fixed_int_encoding_fills_one_record() {
        let config = bincode::config::standard().with_fixed_int_encoding();
        let bytes = bincode::encode_to_vec(KeyEvent::down(0x07, 0x04), config).unwrap();
        assert_eq!(bytes.len(), KeyEvent::RECORD_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[8], 0x07);
        assert_eq!(bytes[12], 0x04);
    }

    #[test]
    fn display_matches_log_format() {
        let event = KeyEvent::down(0x07, 0x04);
        assert_eq!(
            event.to_string(),
            "Event: { type: 0x1, page: 0x7, code: 0x4 }"
        );
    }
}
