use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::matcher::HostMatcher;
use crate::proxy::server::{self, ProxyContext};
use crate::rewrite::RequestRewriter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Interval between readiness checks in `await_ready`
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    /// Set once the CA is loaded
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

/// Owns one intercepting listener and its background task
pub struct ProxyController {
    config: ProxyConfig,
    rewriter: Arc<RequestRewriter>,
    running: Option<RunningProxy>,
}

impl ProxyController {
    /// Create a controller that applies `rewriter` to every proxied request
    pub fn new(config: ProxyConfig, rewriter: RequestRewriter) -> Self {
        Self {
            config,
            rewriter: Arc::new(rewriter),
            running: None,
        }
    }

    /// Create a controller with the teleport-join rule over the configured endpoints
    pub fn from_config(config: ProxyConfig) -> Self {
        let rewriter = RequestRewriter::teleport_join(&config.endpoints);
        Self::new(config, rewriter)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Path of the CA certificate the client must trust
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_cert_path()
    }

    /// Address actually bound, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listener and spawn the serving task
    ///
    /// Returns once the port is bound; CA preparation and accepting happen in
    /// the background. Starting a running controller returns its address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let intercept_hosts = HostMatcher::from_patterns(&self.config.intercept_hosts)?;
        // Never route our own upstream traffic through a system proxy
        let upstream = reqwest::Client::builder().no_proxy().build()?;

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!("Proxy listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        let (ready_tx, ready) = watch::channel(false);
        let task = tokio::spawn(run_listener(
            listener,
            self.config.ca_dir.clone(),
            intercept_hosts,
            self.rewriter.clone(),
            upstream,
            shutdown.clone(),
            ready_tx,
        ));

        self.running = Some(RunningProxy {
            local_addr,
            shutdown,
            ready,
            task,
        });

        Ok(local_addr)
    }

    /// Wait until the background task has loaded the CA and its certificate is on disk
    ///
    /// Returns false after `timeout`, or early if the proxy is not running or
    /// its task has already exited. A certificate left by an earlier run does
    /// not count until the task has loaded it.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let cert_path = self.ca_cert_path();
        let deadline = Instant::now() + timeout;

        loop {
            let running = match &self.running {
                Some(running) if !running.task.is_finished() => running,
                _ => return false,
            };

            if *running.ready.borrow() && cert_path.exists() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop the listener and release the port; a no-op when not running
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        match running.task.await {
            Ok(()) => {
                info!("Proxy on {} stopped", running.local_addr);
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ProxyError::Task(e.to_string())),
        }
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

async fn run_listener(
    listener: TcpListener,
    ca_dir: PathBuf,
    intercept_hosts: HostMatcher,
    rewriter: Arc<RequestRewriter>,
    upstream: reqwest::Client,
    shutdown: CancellationToken,
    ready: watch::Sender<bool>,
) {
    let ca_dir_for_task = ca_dir.clone();
    let prepared = tokio::select! {
        _ = shutdown.cancelled() => return,
        prepared = tokio::task::spawn_blocking(move || CertificateAuthority::load_or_create(&ca_dir_for_task)) => prepared,
    };

    let ca = match prepared {
        Ok(Ok(ca)) => ca,
        Ok(Err(e)) => {
            error!("Failed to prepare CA material in {:?}: {}", ca_dir, e);
            return;
        }
        Err(e) => {
            error!("CA preparation task failed: {}", e);
            return;
        }
    };

    let ctx = Arc::new(ProxyContext {
        rewriter,
        intercept_hosts,
        ca,
        upstream,
    });

    ready.send_replace(true);
    server::serve(listener, ctx, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::{JOIN_ATTEMPT_ID, TELEPORT_FLAG};
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(ca_dir: &TempDir, port: u16) -> ProxyConfig {
        ProxyConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            ca_dir: ca_dir.path().to_path_buf(),
            ..ProxyConfig::default()
        }
    }

    /// Upstream HTTP server that answers with the request body it received
    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        Ok::<_, Infallible>(Response::new(Full::new(body)))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(socket), service)
                        .await;
                });
            }
        });
        addr
    }

    /// Raw TCP server that echoes every byte back
    async fn spawn_tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    async fn send_connect(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "proxy closed before answering CONNECT");
            head.push(byte[0]);
        }
        (stream, String::from_utf8_lossy(&head).into_owned())
    }

    #[tokio::test]
    async fn test_start_ready_stop_releases_port() {
        let ca_dir = TempDir::new().unwrap();
        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));

        let addr = proxy.start().await.unwrap();
        assert_eq!(proxy.start().await.unwrap(), addr);
        assert!(proxy.await_ready(Duration::from_secs(10)).await);
        assert!(proxy.ca_cert_path().exists());

        proxy.stop().await.unwrap();
        assert!(!proxy.is_running());
        // Second stop is a no-op
        proxy.stop().await.unwrap();

        // Same port is free again
        let mut again = ProxyController::from_config(test_config(&ca_dir, addr.port()));
        assert_eq!(again.start().await.unwrap(), addr);
        again.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let ca_dir = TempDir::new().unwrap();
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut proxy = ProxyController::from_config(test_config(&ca_dir, port));
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn test_await_ready_when_stopped() {
        let ca_dir = TempDir::new().unwrap();
        let proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        assert!(!proxy.await_ready(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_not_ready_when_stored_ca_fails_to_load() {
        let ca_dir = TempDir::new().unwrap();
        CertificateAuthority::load_or_create(ca_dir.path()).unwrap();
        std::fs::write(ca_dir.path().join(crate::ca::CA_KEY_FILE), "garbage").unwrap();

        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        proxy.start().await.unwrap();

        // The stale certificate is on disk, but the CA cannot be loaded
        assert!(proxy.ca_cert_path().exists());
        assert!(!proxy.await_ready(Duration::from_secs(10)).await);
        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_reuses_stored_ca() {
        let ca_dir = TempDir::new().unwrap();
        let stored = CertificateAuthority::load_or_create(ca_dir.path()).unwrap();

        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        proxy.start().await.unwrap();
        assert!(proxy.await_ready(Duration::from_secs(10)).await);
        assert_eq!(
            std::fs::read_to_string(proxy.ca_cert_path()).unwrap(),
            stored.cert_pem()
        );
        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_join_request_rewritten() {
        let upstream = spawn_echo_upstream().await;
        let ca_dir = TempDir::new().unwrap();
        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        let proxy_addr = proxy.start().await.unwrap();
        assert!(proxy.await_ready(Duration::from_secs(10)).await);

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
            .build()
            .unwrap();

        let echoed = client
            .post(format!("http://{upstream}/v1/join-game"))
            .header("Content-Type", "application/json")
            .body(r#"{"placeId":1818}"#)
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();

        let body: serde_json::Value = serde_json::from_slice(&echoed).unwrap();
        assert_eq!(body["placeId"], 1818);
        assert_eq!(body[TELEPORT_FLAG], true);
        assert!(body[JOIN_ATTEMPT_ID].is_string());

        // Unwatched paths are relayed verbatim
        let untouched = client
            .post(format!("http://{upstream}/v1/other"))
            .header("Content-Type", "application/json")
            .body(r#"{"placeId":1818}"#)
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(untouched, Bytes::from(r#"{"placeId":1818}"#));

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnels_unmatched_hosts() {
        let echo = spawn_tcp_echo().await;
        let ca_dir = TempDir::new().unwrap();
        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        let proxy_addr = proxy.start().await.unwrap();
        assert!(proxy.await_ready(Duration::from_secs(10)).await);

        let (mut stream, head) = send_connect(proxy_addr, &echo.to_string()).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        proxy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_intercepts_with_ca_signed_leaf() {
        use rustls::pki_types::ServerName;
        use rustls::{ClientConfig, RootCertStore};
        use tokio_rustls::TlsConnector;

        let ca_dir = TempDir::new().unwrap();
        let mut proxy = ProxyController::from_config(test_config(&ca_dir, 0));
        let proxy_addr = proxy.start().await.unwrap();
        assert!(proxy.await_ready(Duration::from_secs(10)).await);

        // Trust exactly the proxy's CA, as a patched client would
        let ca = CertificateAuthority::load_or_create(ca_dir.path()).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert_der()).unwrap();
        let client_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

        let (stream, head) = send_connect(proxy_addr, "gamejoin.roblox.com:443").await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

        let server_name = ServerName::try_from("gamejoin.roblox.com").unwrap();
        let tls = TlsConnector::from(Arc::new(client_config))
            .connect(server_name, stream)
            .await;
        assert!(tls.is_ok(), "TLS handshake failed: {:?}", tls.err());

        proxy.stop().await.unwrap();
    }
}
