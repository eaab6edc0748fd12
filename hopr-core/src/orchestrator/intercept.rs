//! The proxy as seen by the orchestrator

use async_trait::async_trait;
use hopr_proxy::{ProxyController, ProxyError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of the intercepting listener
#[async_trait]
pub trait InterceptProxy: Send + Sync {
    async fn start(&mut self) -> Result<SocketAddr, ProxyError>;

    /// True once the CA certificate is available, false on timeout
    async fn await_ready(&self, timeout: Duration) -> bool;

    fn ca_cert_path(&self) -> PathBuf;

    /// `host:port` the client settings must point at
    fn host_and_port(&self) -> String;

    async fn stop(&mut self) -> Result<(), ProxyError>;
}

#[async_trait]
impl InterceptProxy for ProxyController {
    async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        ProxyController::start(self).await
    }

    async fn await_ready(&self, timeout: Duration) -> bool {
        ProxyController::await_ready(self, timeout).await
    }

    fn ca_cert_path(&self) -> PathBuf {
        ProxyController::ca_cert_path(self)
    }

    fn host_and_port(&self) -> String {
        self.config().host_and_port()
    }

    async fn stop(&mut self) -> Result<(), ProxyError> {
        ProxyController::stop(self).await
    }
}
