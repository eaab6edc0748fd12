//! Listener configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Port the external application is redirected to.
pub const DEFAULT_PORT: u16 = 51823;

/// Intercepting proxy settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProxyConfig {
    /// Address to bind the listener on
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Fixed listener port; the config override points the client here
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the generated CA certificate and key
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    /// CONNECT targets that get TLS-terminated; everything else is tunneled
    #[serde(default = "default_intercept_hosts")]
    pub intercept_hosts: Vec<String>,
    /// Path fragments of the join endpoints whose bodies are rewritten
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("~/.hopr")
}

fn default_intercept_hosts() -> Vec<String> {
    vec!["*.roblox.com".to_string(), "roblox.com".to_string()]
}

fn default_endpoints() -> Vec<String> {
    [
        "/v1/join-game",
        "/v1/join-game-instance",
        "/v1/join-play-together-game",
        "/v1/join-play-together-game-instance",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ca_dir: default_ca_dir(),
            intercept_hosts: default_intercept_hosts(),
            endpoints: default_endpoints(),
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// `host:port` as written into the client's proxy settings
    pub fn host_and_port(&self) -> String {
        self.bind_addr().to_string()
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca_dir.join(crate::ca::CA_CERT_FILE)
    }

    /// Resolve a leading `~` in path-valued settings
    pub fn expand_paths(&mut self) {
        self.ca_dir = expand_tilde(&self.ca_dir);
    }
}

/// Replace a leading `~` component with the user's home directory
///
/// Paths without one, or when no home directory is known, come back unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match home::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
