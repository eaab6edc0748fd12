//! Local intercepting HTTP proxy for game join requests
//!
//! The proxy accepts plain and CONNECT-tunneled traffic. Tunnels to the
//! configured intercept hosts are TLS-terminated with a locally generated CA
//! so join request bodies can be rewritten before they are relayed upstream.

pub mod ca;
pub mod config;
pub mod error;
pub mod matcher;
pub mod proxy;
pub mod rewrite;

// Re-export commonly used types
pub use ca::CertificateAuthority;
pub use config::{expand_tilde, ProxyConfig, DEFAULT_PORT};
pub use error::{ProxyError, Result};
pub use matcher::HostMatcher;
pub use proxy::ProxyController;
pub use rewrite::{InterceptRule, InterceptedRequest, RequestRewriter, RewriteOutcome};
