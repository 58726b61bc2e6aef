//! Engine Configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults (`DragonConfig::default()`)
//! 2. A TOML file (`config/dragon.toml` unless another path is given)
//! 3. Environment variables prefixed with `DRAGON_`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DRAGON_FAMILY=packet120
//! DRAGON_RESET_PULSE_MS=20
//! DRAGON_DRAIN_TIMEOUT_MS=5000
//! DRAGON_LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dragon_daq::config::DragonConfig;
//!
//! let config = DragonConfig::load()?;
//! println!("family: {}", config.family);
//! # Ok::<(), dragon_daq::config::ConfigError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use dragon_regs::{DeviceFamily, MAX_BUFFER_ORDER};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceOptions;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dragon.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DRAGON_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragonConfig {
    /// Board generation driven by this host.
    #[serde(default)]
    pub family: DeviceFamily,
    /// How long the reset line is held during teardown.
    #[serde(default = "default_reset_pulse_ms")]
    pub reset_pulse_ms: u64,
    /// Upper bound on a deactivation drain; unbounded when absent.
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
    /// Largest page order for one buffer.
    #[serde(default = "default_max_buffer_order")]
    pub max_buffer_order: u32,
    /// Most boards a [`DeviceManager`](crate::manager::DeviceManager) will register.
    #[serde(default = "default_max_devices")]
    pub max_devices: u32,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_reset_pulse_ms() -> u64 {
    100
}

fn default_max_buffer_order() -> u32 {
    MAX_BUFFER_ORDER
}

fn default_max_devices() -> u32 {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DragonConfig {
    fn default() -> Self {
        Self {
            family: DeviceFamily::default(),
            reset_pulse_ms: default_reset_pulse_ms(),
            drain_timeout_ms: None,
            max_buffer_order: default_max_buffer_order(),
            max_devices: default_max_devices(),
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DragonConfig {
    /// Load configuration from `config/dragon.toml` and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - `max_buffer_order` does not exceed the hardware limit
    /// - `max_devices` and `reset_pulse_ms` are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.max_buffer_order > MAX_BUFFER_ORDER {
            return Err(ConfigError::ValidationError(format!(
                "Invalid max_buffer_order {}. Must be 0-{}",
                self.max_buffer_order, MAX_BUFFER_ORDER
            )));
        }

        if self.max_devices == 0 {
            return Err(ConfigError::ValidationError(
                "max_devices must be at least 1".to_string(),
            ));
        }

        if self.reset_pulse_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reset_pulse_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Reset pulse width as a [`Duration`].
    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }

    /// Drain bound, if configured.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    /// Per-device settings derived from this configuration.
    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            family: self.family,
            reset_pulse: self.reset_pulse(),
            drain_timeout: self.drain_timeout(),
            max_buffer_order: self.max_buffer_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = DragonConfig::load_from("/nonexistent/dragon.toml").unwrap();
        assert_eq!(config, DragonConfig::default());
        assert_eq!(config.reset_pulse(), Duration::from_millis(100));
        assert_eq!(config.drain_timeout(), None);
    }

    #[test]
    #[serial]
    fn test_file_values() {
        let file = write_toml(
            r#"
            family = "packet120"
            reset_pulse_ms = 5
            drain_timeout_ms = 250
            "#,
        );
        let config = DragonConfig::load_from(file.path()).unwrap();
        assert_eq!(config.family, DeviceFamily::Packet120);
        assert_eq!(config.reset_pulse_ms, 5);
        assert_eq!(config.drain_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_buffer_order, 10);

        let options = config.device_options();
        assert_eq!(options.family, DeviceFamily::Packet120);
        assert_eq!(options.reset_pulse, Duration::from_millis(5));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_toml("reset_pulse_ms = 5\nlog_level = \"warn\"\n");
        std::env::set_var("DRAGON_RESET_PULSE_MS", "7");
        std::env::set_var("DRAGON_LOG_LEVEL", "debug");
        let result = DragonConfig::load_from(file.path());
        std::env::remove_var("DRAGON_RESET_PULSE_MS");
        std::env::remove_var("DRAGON_LOG_LEVEL");

        let config = result.unwrap();
        assert_eq!(config.reset_pulse_ms, 7);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_validation_rejects_bad_values() {
        let file = write_toml("max_buffer_order = 11\n");
        assert!(matches!(
            DragonConfig::load_from(file.path()),
            Err(ConfigError::ValidationError(_))
        ));

        let config = DragonConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_malformed_file() {
        let file = write_toml("family = \"purple\"\n");
        assert!(matches!(
            DragonConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }
}
