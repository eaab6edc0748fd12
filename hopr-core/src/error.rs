//! Error types for configuration and install patching

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

/// Failure touching an installation's settings or trust bundle
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to change permissions of {path}: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Settings file {path} is not a JSON object: {reason}")]
    InvalidJson { path: PathBuf, reason: String },

    #[error("Failed to update trust bundle {path}: {source}")]
    TrustBundle {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config from {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("{timeout} ({timeout_ms} ms) is shorter than {interval} ({interval_ms} ms)")]
    TimeoutTooShort {
        timeout: &'static str,
        timeout_ms: u64,
        interval: &'static str,
        interval_ms: u64,
    },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("Invalid wildcard pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("Proxy port must be fixed; 0 is not allowed")]
    EphemeralPort,
}
