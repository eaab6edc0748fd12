use crate::ca::CertificateAuthority;
use crate::error::Result;
use crate::matcher::HostMatcher;
use crate::proxy::forward;
use crate::rewrite::RequestRewriter;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type ProxyBody = Full<Bytes>;

/// Shared state for every connection served by one listener
pub(crate) struct ProxyContext {
    pub rewriter: Arc<RequestRewriter>,
    pub intercept_hosts: HostMatcher,
    pub ca: CertificateAuthority,
    pub upstream: reqwest::Client,
}

/// Accept connections until `shutdown` fires
///
/// Connection tasks watch the same token, so cancelling it tears down every
/// in-flight tunnel as well as the listener.
pub(crate) async fn serve(listener: TcpListener, ctx: Arc<ProxyContext>, shutdown: CancellationToken) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept proxy connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        debug!("Proxy client connected: {}", peer_addr);

        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let service_shutdown = shutdown.clone();
            let service = service_fn(move |req| {
                handle_request(req, ctx.clone(), service_shutdown.clone())
            });
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(socket), service)
                .with_upgrades();

            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!("Connection from {} ended: {}", peer_addr, e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Dropping connection from {} on shutdown", peer_addr);
                }
            }
        });
    }

    info!("Proxy listener closed");
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    shutdown: CancellationToken,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, ctx, shutdown));
    }

    // Plain HTTP proxy requests carry an absolute-form target
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        debug!("Rejecting non-proxy request for {}", req.uri());
        return Ok(status_response(StatusCode::BAD_REQUEST));
    }

    let target = req.uri().clone();
    Ok(forward::forward(req, target, &ctx).await)
}

/// Answer a CONNECT and take over the upgraded stream in the background
fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    shutdown: CancellationToken,
) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        debug!("CONNECT without authority: {}", req.uri());
        return status_response(StatusCode::BAD_REQUEST);
    };

    let host = strip_brackets(req.uri().host().unwrap_or_default()).to_string();
    let port = req.uri().port_u16().unwrap_or(443);
    let intercept = ctx.intercept_hosts.matches_host(&host);
    debug!(
        "CONNECT {} ({})",
        authority,
        if intercept { "intercept" } else { "tunnel" }
    );

    tokio::spawn(async move {
        let upgraded = tokio::select! {
            _ = shutdown.cancelled() => return,
            upgraded = hyper::upgrade::on(req) => match upgraded {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("CONNECT upgrade failed for {}: {}", authority, e);
                    return;
                }
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = async {
                if intercept {
                    intercept_tls(upgraded, &host, port, ctx).await
                } else {
                    tunnel(upgraded, &authority).await
                }
            } => result,
        };

        match result {
            Ok(()) => debug!("Tunnel closed for {}", authority),
            Err(e) => debug!("Tunnel for {} ended with error: {}", authority, e),
        }
    });

    Response::new(Full::new(Bytes::new()))
}

/// Relay bytes without inspection
async fn tunnel(upgraded: Upgraded, authority: &str) -> Result<()> {
    let mut remote = TcpStream::connect(authority).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut remote).await?;
    Ok(())
}

/// Terminate TLS with a leaf for `host` and serve HTTP/1.1 inside the tunnel
async fn intercept_tls(upgraded: Upgraded, host: &str, port: u16, ctx: Arc<ProxyContext>) -> Result<()> {
    let server_config = ctx.ca.server_config(host)?;
    let tls = TlsAcceptor::from(server_config)
        .accept(TokioIo::new(upgraded))
        .await?;
    debug!("TLS established for {}:{}", host, port);

    let origin = if port == 443 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let target = https_target(&origin, req.uri());
        async move {
            let response = match target {
                Some(target) => forward::forward(req, target, &ctx).await,
                None => status_response(StatusCode::BAD_REQUEST),
            };
            Ok::<_, Infallible>(response)
        }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await?;
    Ok(())
}

/// Rebuild the absolute upstream URI for a request received inside a tunnel
fn https_target(origin: &str, uri: &Uri) -> Option<Uri> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Uri::builder()
        .scheme("https")
        .authority(origin)
        .path_and_query(path)
        .build()
        .ok()
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
