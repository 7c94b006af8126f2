//! Engine errors.

use keybridge_hid::HidError;
use keybridge_types::Category;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no devices registered")]
    NothingRegistered,

    #[error("already grabbed")]
    AlreadyGrabbed,

    #[error("listener loop failed to start: {0}")]
    ListenerStart(String),

    #[error("listener loop is not running")]
    ListenerStopped,

    #[error("hid error: {0}")]
    Hid(#[from] HidError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Status code returned across the C boundary by `grab`.
    pub fn status(&self) -> i32 {
        match self {
            Self::NothingRegistered => 1,
            Self::AlreadyGrabbed => 2,
            _ => -1,
        }
    }
}

/// Why an event could not be applied to the held-key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("invalid key value {value}")]
    InvalidValue { value: u64 },

    #[error("unknown usage page {page:#x}")]
    UnknownCategory { page: u32 },

    #[error("{category} report is full")]
    ReportFull { category: Category },
}

impl ApplyError {
    /// Status code returned across the C boundary by `send_key`.
    pub fn status(&self) -> i32 {
        match self {
            Self::InvalidValue { .. } => 1,
            Self::UnknownCategory { .. } => 2,
            Self::ReportFull { .. } => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("event channel closed")]
    Closed,

    #[error("short record: {len} of {expected} bytes")]
    ShortRecord { len: usize, expected: usize },

    #[error("malformed record: {0}")]
    Decode(String),
}
