//! Engine configuration loaded from TOML.

use std::time::Duration;

use keybridge_types::CountryCode;
use serde::{Deserialize, Serialize};

use crate::registry::ExclusionPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Capture side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Devices whose name contains any of these strings are never captured.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Event channel capacity, in records.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How often the polling notification source rescans devices.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    /// Capture keyboards that first appear after an unfiltered registration.
    #[serde(default)]
    pub adopt_new_devices: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
            channel_capacity: default_channel_capacity(),
            rescan_interval_ms: default_rescan_interval_ms(),
            adopt_new_devices: false,
        }
    }
}

impl CaptureConfig {
    pub fn exclusion_policy(&self) -> ExclusionPolicy {
        ExclusionPolicy::new(self.exclude.clone())
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

/// Virtual sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub country_code: CountryCode,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            country_code: CountryCode::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exclude() -> Vec<String> {
    vec!["Karabiner".to_string(), default_device_name()]
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_rescan_interval_ms() -> u64 {
    500
}

fn default_device_name() -> String {
    "keybridge virtual keyboard".to_string()
}
