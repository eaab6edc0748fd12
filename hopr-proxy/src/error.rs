//! Error types for proxy operations

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to load CA material from {path}: {source}")]
    CaLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Proxy task failed: {0}")]
    Task(String),

    #[error("Invalid intercept pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
