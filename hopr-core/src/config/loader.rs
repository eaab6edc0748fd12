//! Configuration file loading

use super::schema::Config;
use super::validator::ConfigValidator;
use crate::error::ConfigError;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "HOPR_CONFIG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::config_path_with(|key| env::var(key).ok(), home::home_dir())
    }

    // Priority order:
    // 1. $HOPR_CONFIG
    // 2. $XDG_CONFIG_HOME/hopr/config.toml
    // 3. ~/.config/hopr/config.toml
    fn config_path_with<F>(lookup: F, home: Option<PathBuf>) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }

        if let Some(xdg) = lookup("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
            return PathBuf::from(xdg).join("hopr/config.toml");
        }

        if let Some(home) = home {
            return home.join(".config/hopr/config.toml");
        }

        PathBuf::from("config.toml")
    }

    /// Load config from a file, without validation
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load, expand and validate configuration
    ///
    /// Priority: explicit path > default path > built-in defaults. An
    /// explicit path must exist; a missing default file falls back silently.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(&p)?,
            None => {
                let default_path = Self::default_config_path();
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    tracing::debug!(
                        "Config file not found at {:?}, using defaults",
                        default_path
                    );
                    Config::default()
                }
            }
        };

        config.expand_paths();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }
}
