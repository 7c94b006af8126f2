//! Linux backend: evdev capture and a uinput virtual keyboard.

mod capture;
pub mod keymap;
mod sink;

pub use capture::EvdevPlatform;
pub use sink::UinputClient;
