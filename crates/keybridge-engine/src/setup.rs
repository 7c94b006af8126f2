//! Config loading and session construction.

use std::path::PathBuf;

use tracing::info;

use crate::config::Config;
use crate::error::EngineError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KEYBRIDGE_CONFIG";

/// Load configuration from the given path, `$KEYBRIDGE_CONFIG`, or the
/// default location. A missing file means defaults.
pub fn load_config(path: Option<&str>) -> Result<Config, EngineError> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => std::env::var_os(CONFIG_ENV).map_or_else(default_config_path, PathBuf::from),
    };

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| EngineError::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))?;
        info!(path = %config_path.display(), "loaded config");
        Ok(config)
    } else {
        info!("no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Get the default config directory path.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("keybridge")
}

fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Build a session over the evdev platform and the uinput sink.
#[cfg(feature = "linux")]
pub fn linux_session(
    config: &Config,
) -> crate::Session<keybridge_hid::linux::EvdevPlatform, keybridge_hid::linux::UinputClient> {
    let platform = keybridge_hid::linux::EvdevPlatform::new(config.capture.rescan_interval());
    let client = keybridge_hid::linux::UinputClient::new(config.sink.device_name.clone());
    crate::Session::new(platform, client, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_path_gives_defaults() {
        let config = load_config(Some("/nonexistent/keybridge/config.toml")).unwrap();
        assert_eq!(config.capture.channel_capacity, 1024);
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let path = std::env::temp_dir().join(format!("keybridge-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[capture]\nchannel_capacity = \"many\"\n").unwrap();
        let result = load_config(path.to_str());
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn config_dir_ends_with_keybridge() {
        assert!(config_dir().ends_with("keybridge"));
    }
}
