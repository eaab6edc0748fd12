//! Join orchestration for the hopr proxy
//!
//! Wires the intercepting proxy from `hopr-proxy` to the client's on-disk
//! settings and process lifecycle.

pub mod config;
pub mod error;
pub mod install;
pub mod launch;
pub mod orchestrator;
pub mod watcher;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator};
pub use error::{ConfigError, PatchError, Result, ValidationError};
pub use install::{AppInstallation, ConfigOverride, ConfigPatcher, InstallRoot};
pub use launch::{DeepLinkLauncher, JoinTarget, Launcher};
pub use orchestrator::{
    FailureReason, InterceptProxy, JoinOrchestrator, OrchestrationState, RunOutcome, StatusUpdate,
};
pub use watcher::{ProcessSignal, ProcessSnapshot, ProcessTable, ProcessWatcher, SystemProcessTable};
