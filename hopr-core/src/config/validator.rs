//! Configuration validation

use super::schema::{Config, OrchestratorConfig};
use crate::error::ValidationError;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate entire configuration
    pub fn validate(config: &Config) -> Result<(), ValidationError> {
        Self::validate_timings(&config.orchestrator)?;
        Self::validate_proxy(config)?;
        Self::validate_install(config)?;
        Self::validate_processes(config)?;
        Ok(())
    }

    fn validate_timings(timings: &OrchestratorConfig) -> Result<(), ValidationError> {
        if timings.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroInterval {
                field: "poll_interval_ms",
            });
        }
        if timings.exit_poll_interval_ms == 0 {
            return Err(ValidationError::ZeroInterval {
                field: "exit_poll_interval_ms",
            });
        }

        // Both budgets are counted in poll ticks; each needs at least one
        for (timeout, timeout_ms) in [
            ("launch_timeout_ms", timings.launch_timeout_ms),
            ("ready_timeout_ms", timings.ready_timeout_ms),
        ] {
            if timeout_ms < timings.poll_interval_ms {
                return Err(ValidationError::TimeoutTooShort {
                    timeout,
                    timeout_ms,
                    interval: "poll_interval_ms",
                    interval_ms: timings.poll_interval_ms,
                });
            }
        }

        if timings.ca_wait_timeout_ms == 0 {
            return Err(ValidationError::ZeroInterval {
                field: "ca_wait_timeout_ms",
            });
        }

        Ok(())
    }

    fn validate_proxy(config: &Config) -> Result<(), ValidationError> {
        if config.proxy.port == 0 {
            return Err(ValidationError::EphemeralPort);
        }
        if config.proxy.endpoints.is_empty() {
            return Err(ValidationError::Empty {
                field: "proxy.endpoints",
            });
        }
        // A blank fragment is contained in every path
        if config.proxy.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ValidationError::Empty {
                field: "proxy.endpoints entry",
            });
        }

        for pattern in &config.proxy.intercept_hosts {
            if pattern.is_empty()
                || pattern.contains("**")
                || pattern.contains('\0')
                || pattern.contains('\n')
            {
                return Err(ValidationError::InvalidPattern {
                    pattern: pattern.clone(),
                });
            }
        }

        Ok(())
    }

    fn validate_install(config: &Config) -> Result<(), ValidationError> {
        if config.install.roots.is_empty() {
            return Err(ValidationError::Empty {
                field: "install.roots",
            });
        }
        if config.install.executable_suffix.is_empty() {
            return Err(ValidationError::Empty {
                field: "install.executable_suffix",
            });
        }
        if config.install.settings_file.as_os_str().is_empty() {
            return Err(ValidationError::Empty {
                field: "install.settings_file",
            });
        }
        if config.install.trust_bundle.as_os_str().is_empty() {
            return Err(ValidationError::Empty {
                field: "install.trust_bundle",
            });
        }
        Ok(())
    }

    fn validate_processes(config: &Config) -> Result<(), ValidationError> {
        if config.processes.target.is_empty() {
            return Err(ValidationError::Empty {
                field: "processes.target",
            });
        }
        if config.processes.crash_handler.is_empty() {
            return Err(ValidationError::Empty {
                field: "processes.crash_handler",
            });
        }
        Ok(())
    }
}
