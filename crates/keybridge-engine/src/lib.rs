//! Device capture and state-synchronization engine for keybridge.
//!
//! A [`Session`] registers keyboard identities, seizes the matching devices
//! on a dedicated listener loop thread, streams their key transitions through
//! a bounded event channel, and mirrors the state the caller sends back into
//! a virtual keyboard.

pub mod channel;
pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod output;
pub mod registry;
pub mod session;
pub mod setup;
pub mod watcher;

pub use channel::Received;
pub use config::Config;
pub use error::{ApplyError, ChannelError, EngineError};
pub use output::{ConnectionState, HeldKeySet, OutputAggregator};
pub use registry::{DeviceRegistry, ExclusionPolicy, RegisteredSet, SharedRegistered};
pub use session::Session;
