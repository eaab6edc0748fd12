//! Application configuration

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{Config, InstallConfig, InstallRootConfig, OrchestratorConfig, ProcessConfig};
pub use validator::ConfigValidator;
