//! Configuration module
//!
//! Handles the TOML settings file and platform directories

mod settings;

pub use settings::{AppConfig, ConfigError, LoggingConfig, PublishConfig, RegisterSource};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Config file name inside [`config_dir`]
pub const CONFIG_FILE: &str = "config.toml";

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "kamstrup-optical", "KamstrupOptical")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(CONFIG_FILE))
}
