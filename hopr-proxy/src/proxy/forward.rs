//! Upstream forwarding for proxied requests

use crate::error::Result;
use crate::proxy::server::{status_response, ProxyBody, ProxyContext};
use crate::rewrite::{InterceptedRequest, RewriteOutcome};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONTENT_LENGTH, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use tracing::{debug, info, warn};

/// Headers that describe a single hop and must not be relayed
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Buffer the request, run it through the rewriter, and relay it upstream
pub(crate) async fn forward(req: Request<Incoming>, target: Uri, ctx: &ProxyContext) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body for {}: {}", target, e);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let mut request = InterceptedRequest {
        method: parts.method,
        uri: target,
        headers: parts.headers,
        body,
    };

    match ctx.rewriter.rewrite(&mut request) {
        RewriteOutcome::Rewritten => {
            info!("Rewrote join request {} {}", request.method, request.uri.path());
        }
        RewriteOutcome::Malformed => {
            warn!(
                "Join request to {} has no JSON object body; forwarding unchanged",
                request.uri.path()
            );
        }
        outcome @ (RewriteOutcome::NotJson | RewriteOutcome::Unchanged) => {
            debug!("Join request to {} left as-is: {:?}", request.uri.path(), outcome);
        }
        RewriteOutcome::NotWatched => {}
    }

    let description = format!("{} {}", request.method, request.uri);
    match send_upstream(&ctx.upstream, request).await {
        Ok(response) => {
            debug!("{} -> {}", description, response.status());
            response
        }
        Err(e) => {
            warn!("Upstream request {} failed: {}", description, e);
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn send_upstream(client: &reqwest::Client, request: InterceptedRequest) -> Result<Response<ProxyBody>> {
    let mut headers = HeaderMap::new();
    for (name, value) in request.headers.iter() {
        // reqwest derives Host and Content-Length from the URL and body
        if is_hop_by_hop(name) || *name == HOST || *name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let upstream = client
        .request(request.method, request.uri.to_string())
        .headers(headers)
        .body(request.body)
        .send()
        .await?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let body = upstream.bytes().await?;

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    for (name, value) in upstream_headers.iter() {
        if is_hop_by_hop(name) || *name == CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("proxy-authorization")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("cookie")));
    }
}
