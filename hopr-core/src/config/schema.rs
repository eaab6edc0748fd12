//! Configuration schema types

use hopr_proxy::config::expand_tilde;
use hopr_proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub processes: ProcessConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Resolve a leading `~` in every path-valued setting
    pub fn expand_paths(&mut self) {
        self.proxy.expand_paths();
        for root in &mut self.install.roots {
            root.path = expand_tilde(&root.path);
        }
    }
}

/// A directory that may hold a client installation
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstallRootConfig {
    pub name: String,
    pub path: PathBuf,
}

/// Where installations live and which files inside them get patched
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstallConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<InstallRootConfig>,
    /// Settings file, relative to the installation root
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    /// File name suffix that marks a version folder as holding the client
    #[serde(default = "default_executable_suffix")]
    pub executable_suffix: String,
    /// CA bundle, relative to each version folder
    #[serde(default = "default_trust_bundle")]
    pub trust_bundle: PathBuf,
}

fn default_roots() -> Vec<InstallRootConfig> {
    ["Roblox", "Bloxstrap", "Fishstrap"]
        .iter()
        .map(|name| InstallRootConfig {
            name: name.to_string(),
            path: PathBuf::from("~/AppData/Local").join(name),
        })
        .collect()
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("ClientSettings/IxpSettings.json")
}

fn default_executable_suffix() -> String {
    "PlayerBeta.exe".to_string()
}

fn default_trust_bundle() -> PathBuf {
    PathBuf::from("ssl/cacert.pem")
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            settings_file: default_settings_file(),
            executable_suffix: default_executable_suffix(),
            trust_bundle: default_trust_bundle(),
        }
    }
}

/// Process names the watcher looks for
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProcessConfig {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_crash_handler")]
    pub crash_handler: String,
}

fn default_target() -> String {
    "RobloxPlayerBeta.exe".to_string()
}

fn default_crash_handler() -> String {
    "RobloxCrashHandler.exe".to_string()
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            crash_handler: default_crash_handler(),
        }
    }
}

/// Poll cadence and timeouts, in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_ca_wait_timeout_ms")]
    pub ca_wait_timeout_ms: u64,
    #[serde(default = "default_exit_poll_interval_ms")]
    pub exit_poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub lock_join_while_active: bool,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_launch_timeout_ms() -> u64 {
    10_000
}

fn default_ready_timeout_ms() -> u64 {
    5_000
}

fn default_ca_wait_timeout_ms() -> u64 {
    10_000
}

fn default_exit_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            ca_wait_timeout_ms: default_ca_wait_timeout_ms(),
            exit_poll_interval_ms: default_exit_poll_interval_ms(),
            lock_join_while_active: default_true(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ca_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ca_wait_timeout_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}
