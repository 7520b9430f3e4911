//! Layered configuration using Figment.
//!
//! Values come from, in increasing precedence:
//! 1. built-in defaults
//! 2. a TOML file (`config/sdrhal.toml` unless another path is given)
//! 3. environment variables prefixed with `SDRHAL_`, nested with `__`
//!    (`SDRHAL_STREAM__NUM_BUFFERS=32`)
//!
//! # Example
//! ```no_run
//! use sdrhal::HalConfig;
//!
//! let config = HalConfig::load().expect("configuration");
//! config.validate().expect("valid configuration");
//! println!("opening {}", config.device.identifier);
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use sdr_core::stream::SAMPLES_PER_BUFFER_MULTIPLE;
use sdr_core::{SampleFormat, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/sdrhal.toml";
pub const ENV_PREFIX: &str = "SDRHAL_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    pub logging: LoggingConfig,
    pub device: DeviceConfig,
    pub stream: StreamDefaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Which device [`crate::Device::open_from_config`] opens.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier, e.g. `"sim:serial=a1b2"`. Empty opens the first
    /// device found.
    pub identifier: String,
}

/// Stream geometry used when a caller does not supply its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    pub format: SampleFormat,
    pub num_buffers: usize,
    pub samples_per_buffer: usize,
    pub num_transfers: usize,
    /// Zero waits forever.
    pub timeout_ms: u64,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        let config = StreamConfig::default();
        Self {
            format: config.format,
            num_buffers: config.num_buffers,
            samples_per_buffer: config.samples_per_buffer,
            num_transfers: config.num_transfers,
            timeout_ms: u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl StreamDefaults {
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.format, self.num_buffers, self.samples_per_buffer)
            .with_transfers(self.num_transfers)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

impl HalConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file
    /// leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: HalConfig = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HalConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::logging::parse_log_level(&self.logging.level).map_err(ConfigError::Invalid)?;
        self.logging
            .format
            .parse::<crate::logging::OutputFormat>()
            .map_err(ConfigError::Invalid)?;

        if !self.device.identifier.is_empty() {
            self.device
                .identifier
                .parse::<sdr_core::DevInfo>()
                .map_err(|e| ConfigError::Invalid(format!("device.identifier: {}", e)))?;
        }

        let stream = &self.stream;
        if stream.num_buffers == 0 || stream.num_transfers == 0 {
            return Err(ConfigError::Invalid(
                "stream.num_buffers and stream.num_transfers must be non-zero".into(),
            ));
        }
        if stream.num_transfers > stream.num_buffers {
            return Err(ConfigError::Invalid(format!(
                "stream.num_transfers ({}) exceeds stream.num_buffers ({})",
                stream.num_transfers, stream.num_buffers
            )));
        }
        if stream.samples_per_buffer == 0
            || stream.samples_per_buffer % SAMPLES_PER_BUFFER_MULTIPLE != 0
        {
            return Err(ConfigError::Invalid(format!(
                "stream.samples_per_buffer ({}) must be a non-zero multiple of {}",
                stream.samples_per_buffer, SAMPLES_PER_BUFFER_MULTIPLE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_validate() {
        let config = HalConfig::load_from("/nonexistent/sdrhal.toml").unwrap();
        assert_eq!(config, HalConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.to_stream_config(), StreamConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [logging]
            level = "debug"

            [device]
            identifier = "sim:serial=a1b2"

            [stream]
            format = "sc8_q7"
            num_buffers = 8
            samples_per_buffer = 2048
            num_transfers = 4
            timeout_ms = 250
            "#,
        );
        let config = HalConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.device.identifier, "sim:serial=a1b2");
        assert!(config.validate().is_ok());

        let stream = config.stream.to_stream_config();
        assert_eq!(stream.format, SampleFormat::Sc8Q7);
        assert_eq!(stream.num_transfers, 4);
        assert_eq!(stream.timeout, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[stream]\nnum_buffers = 8\nnum_transfers = 4\n");
        std::env::set_var("SDRHAL_STREAM__NUM_BUFFERS", "32");
        std::env::set_var("SDRHAL_LOGGING__FORMAT", "json");
        let result = HalConfig::load_from(file.path());
        std::env::remove_var("SDRHAL_STREAM__NUM_BUFFERS");
        std::env::remove_var("SDRHAL_LOGGING__FORMAT");

        let config = result.unwrap();
        assert_eq!(config.stream.num_buffers, 32);
        assert_eq!(config.stream.num_transfers, 4);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    #[serial]
    fn test_written_config_reloads() {
        let mut config = HalConfig::default();
        config.device.identifier = "sim:serial=ff00 instance=1".into();
        config.stream.timeout_ms = 0;
        let file = write_config(&toml::to_string(&config).unwrap());

        let reloaded = HalConfig::load_from(file.path()).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.stream.to_stream_config().timeout, Duration::ZERO);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = HalConfig::default();
        config.logging.level = "chatty".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = HalConfig::default();
        config.stream.num_transfers = config.stream.num_buffers + 1;
        assert!(config.validate().is_err());

        let mut config = HalConfig::default();
        config.stream.samples_per_buffer = 1000;
        assert!(config.validate().is_err());

        let mut config = HalConfig::default();
        config.device.identifier = "carrier-pigeon:serial=1".into();
        assert!(config.validate().is_err());
    }
}
