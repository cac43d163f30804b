//! Application settings

use crate::core::poller::PollConfig;
use crate::core::publish::PublishFormat;
use crate::core::registers::{CatalogError, CatalogPreset, RegisterCatalog, RegisterDescriptor};
use crate::core::transport::SerialConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Platform has no config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File concerned
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for [`AppConfig`]
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serializing failed
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Register list rejected
    #[error("Invalid register list: {0}")]
    Catalog(#[from] CatalogError),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Where the register catalog comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterSource {
    /// Built-in catalog
    Preset(CatalogPreset),
    /// Explicit ordered list
    List(Vec<RegisterDescriptor>),
}

impl Default for RegisterSource {
    fn default() -> Self {
        Self::Preset(CatalogPreset::Single)
    }
}

/// Publish cadence and format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Time between publish rounds
    pub interval_ms: u64,
    /// Output format for stdout
    pub format: PublishFormat,
    /// Serve register gauges for Prometheus on this address
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            format: PublishFormat::Text,
            metrics_listen: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write a daily log file into this directory
    pub directory: Option<PathBuf>,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            level: "info".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Optical head port
    pub serial: SerialConfig,
    /// Timing and retries
    pub polling: PollConfig,
    /// Publishing
    pub publish: PublishConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Registers to poll
    pub registers: RegisterSource,
}

impl AppConfig {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        self.save_to(&path)?;
        Ok(path)
    }

    /// Load and validate config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the register catalog
    pub fn catalog(&self) -> Result<RegisterCatalog, ConfigError> {
        match &self.registers {
            RegisterSource::Preset(preset) => Ok(RegisterCatalog::preset(*preset)),
            RegisterSource::List(entries) => Ok(RegisterCatalog::new(entries.clone())?),
        }
    }

    /// Check ranges and the register list
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.catalog()?;

        let durations = [
            ("polling.response_timeout_ms", self.polling.response_timeout_ms),
            ("polling.sweep_period_ms", self.polling.sweep_period_ms),
            ("polling.tick_ms", self.polling.tick_ms),
            ("publish.interval_ms", self.publish.interval_ms),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.serial.port.is_empty() {
            return Err(ConfigError::Invalid {
                field: "serial.port",
                reason: "must not be empty".to_string(),
            });
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid {
                field: "serial.baud_rate",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::Invalid {
                field: "serial.data_bits",
                reason: format!("{} is not one of 5, 6, 7, 8", self.serial.data_bits),
            });
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ConfigError::Invalid {
                field: "serial.stop_bits",
                reason: format!("{} is not 1 or 2", self.serial.stop_bits),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registers::RegisterId;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.catalog().unwrap().len(), 13);
        assert_eq!(config.polling.retry_limit, 3);
        assert_eq!(config.publish.interval_ms, 60_000);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.serial.port = "/dev/ttyAMA0".to_string();
        config.polling.retry_on_timeout = true;
        config.publish.format = PublishFormat::Json;
        config.publish.metrics_listen = Some(SocketAddr::from(([127, 0, 0, 1], 9184)));
        config.registers = RegisterSource::List(vec![
            RegisterDescriptor::new(0x0001, "EnergyIn", Some("kWh")),
            RegisterDescriptor::new(0x041e, "VoltageP1", None),
        ]);
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.catalog().unwrap().get(1).map(|d| d.id),
            Some(RegisterId(0x041e))
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[polling]\npacing_ms = 250\n\n[registers]\npreset = \"bidirectional\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.polling.pacing_ms, 250);
        assert_eq!(config.polling.response_timeout_ms, 500);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.registers, RegisterSource::Preset(CatalogPreset::Bidirectional));
    }

    #[test]
    fn test_hex_register_ids() {
        let toml = r#"
            [[registers.list]]
            id = 0x03ff
            label = "CurrentPower"
            unit = "kW"
        "#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.get(0).map(|d| d.id), Some(RegisterId(0x03ff)));
    }

    #[test]
    fn test_rejects_duplicates_and_zero_durations() {
        let mut config = AppConfig::default();
        config.registers = RegisterSource::List(vec![
            RegisterDescriptor::new(1, "A", None),
            RegisterDescriptor::new(1, "B", None),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Catalog(CatalogError::Duplicate(RegisterId(1))))
        ));

        let mut config = AppConfig::default();
        config.registers = RegisterSource::List(Vec::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Catalog(CatalogError::Empty))
        ));

        let mut config = AppConfig::default();
        config.polling.tick_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "polling.tick_ms", .. })
        ));
    }

    #[test]
    fn test_rejects_unsupported_line_settings() {
        let mut config = AppConfig::default();
        config.serial.data_bits = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "serial.data_bits", .. })
        ));

        let mut config = AppConfig::default();
        config.serial.stop_bits = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "serial.stop_bits", .. })
        ));

        let mut config = AppConfig::default();
        config.serial.data_bits = 7;
        config.serial.stop_bits = 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_file_with_stop_bits_out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[serial]\nport = \"/dev/ttyUSB0\"\nstop_bits = 3\n").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "serial.stop_bits", .. }));
    }

    #[test]
    fn test_bidirectional_extended_by_list() {
        // Site-specific export registers on top of the preset
        let mut entries = CatalogPreset::Bidirectional.descriptors();
        entries.extend([
            RegisterDescriptor::new(0x0441, "ExportP1", Some("kW")),
            RegisterDescriptor::new(0x0442, "ExportP2", Some("kW")),
            RegisterDescriptor::new(0x0443, "ExportP3", Some("kW")),
        ]);
        let mut config = AppConfig::default();
        config.registers = RegisterSource::List(entries);

        config.validate().unwrap();
        assert_eq!(config.catalog().unwrap().len(), 19);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
