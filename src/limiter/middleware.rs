use super::RateLimiter;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

const UNKNOWN_CLIENT: &str = "unknown";

// Only a reverse proxy on the same host may speak for the client.
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let candidate = forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })?;

    match candidate.parse::<IpAddr>() {
        Ok(ip) if !ip.is_loopback() => Some(ip.to_string()),
        _ => {
            warn!(forwarded = candidate, "ignoring unusable forwarded client address");
            None
        }
    }
}

/// Key a request by the peer address from `ConnectInfo`.
///
/// `x-forwarded-for` (first hop) and then `x-real-ip` replace it only when the peer
/// itself is a loopback proxy. Without a peer address every request shares the
/// `unknown` key.
#[must_use]
pub fn client_key(request: &Request) -> String {
    let Some(peer) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return UNKNOWN_CLIENT.to_string();
    };

    if peer.is_loopback() {
        if let Some(forwarded) = forwarded_ip(request.headers()) {
            return forwarded;
        }
    }

    peer.to_string()
}

/// Refuse throttled clients before the wrapped service runs; admitted requests
/// carry a [`super::ResetHandle`] in their extensions.
pub async fn prevent(
    State(limiter): State<RateLimiter>,
    mut request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);

    match limiter.check(&key).await {
        Ok(handle) => {
            request.extensions_mut().insert(handle);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}
