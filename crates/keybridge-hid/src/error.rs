//! HID subsystem errors.

use thiserror::Error;

use crate::NotificationKind;

#[derive(Debug, Error)]
pub enum HidError {
    #[error("failed to open device {device}: {reason}")]
    DeviceOpen {
        device: String,
        code: Option<i32>,
        reason: String,
    },

    #[error("failed to seize device {device}: {reason}")]
    DeviceSeize {
        device: String,
        code: Option<i32>,
        reason: String,
    },

    #[error("failed to close device {device}: {reason}")]
    DeviceClose {
        device: String,
        code: Option<i32>,
        reason: String,
    },

    #[error("failed to install {kind} notification: {reason}")]
    Subscribe {
        kind: NotificationKind,
        reason: String,
    },

    #[error("failed to create virtual device: {0}")]
    VirtualDeviceCreate(String),

    #[error("failed to post report: {0}")]
    Post(String),

    #[error("virtual sink is not connected")]
    NotConnected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HidError {
    /// OS error code behind this error, when there is one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::DeviceOpen { code, .. }
            | Self::DeviceSeize { code, .. }
            | Self::DeviceClose { code, .. } => *code,
            _ => None,
        }
    }
}
