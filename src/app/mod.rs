//! Host integration: mounts application routes behind the rate limiter and the gate.
//!
//! Request order for application routes is limiter, then gate, then handler.
//! `GET /health` is always mounted and never guarded. Unknown routes answer
//! `404 {"error": "cannot <METHOD> <path>"}` and handler panics answer a fixed 500.

mod handlers;
mod listener;

pub use handlers::{INTERNAL_ERROR, health};
pub use listener::{MAX_PORT_ATTEMPTS, bind};

use crate::{
    gate::{Gate, authenticate},
    limiter::{RateLimiter, prevent},
};
use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware,
    routing::get,
};
use std::{
    future::Future,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info, warn};
use ulid::Ulid;

pub const DEFAULT_PORT: u16 = 8080;

pub struct App {
    name: Arc<str>,
    host: IpAddr,
    port: u16,
    routes: Router,
    mounted: bool,
    gate: Option<Arc<Gate>>,
    limiter: Option<RateLimiter>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("gate", &self.gate.is_some())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl App {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            host: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            routes: Router::new(),
            mounted: false,
            gate: None,
            limiter: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Merge application routes. They sit behind the gate and limiter when enabled,
    /// and must define at least one route and must not define `/health`.
    #[must_use]
    pub fn routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self.mounted = true;
        self
    }

    #[must_use]
    pub fn enable_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(Arc::new(gate));
        self
    }

    #[must_use]
    pub fn enable_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn into_router(self) -> Router {
        let mut routes = self.routes;
        // route_layer panics on a router without routes.
        if self.mounted {
            if let Some(gate) = self.gate {
                routes = routes.route_layer(middleware::from_fn_with_state(gate, authenticate));
            }
            // Added last so it runs first.
            if let Some(limiter) = self.limiter {
                routes = routes.route_layer(middleware::from_fn_with_state(limiter, prevent));
            }
        }

        Router::new()
            .route("/health", get(health).with_state(self.name))
            .merge(routes)
            .fallback(handlers::not_found)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestHeaderLayer::if_not_present(
                        HeaderName::from_static("x-request-id"),
                        |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                    ))
                    .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                        "x-request-id",
                    )))
                    .layer(TraceLayer::new_for_http().make_span_with(make_span))
                    .layer(CatchPanicLayer::custom(handlers::handle_panic)),
            )
    }

    /// Serve until Ctrl-C.
    ///
    /// # Errors
    /// Returns an error if no port can be bound or the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {err}");
            }
        })
        .await
    }

    /// Serve until `shutdown` completes. When the port is taken the next free one is used.
    ///
    /// # Errors
    /// Returns an error if no port can be bound or the server fails.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = bind(SocketAddr::new(self.host, self.port), MAX_PORT_ATTEMPTS).await?;
        let addr = listener.local_addr()?;
        let name = Arc::clone(&self.name);

        info!("{name} app started on {addr}");

        axum::serve(
            listener,
            self.into_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        warn!("{name} app stopped");

        Ok(())
    }
}

// Headers stay out of the span: they carry the session token.
fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let method = request.method().as_str();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", method, path, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::to_bytes,
        http::{Method, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn call(
        router: Router,
        method: Method,
        uri: &str,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let request = Request::builder().method(method).uri(uri).body(Body::empty())?;
        let response = router.oneshot(request).await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, serde_json::from_slice(&body)?))
    }

    #[tokio::test]
    async fn health_is_always_mounted() -> anyhow::Result<()> {
        let router = App::new("accounts").into_router();
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-app"));
        assert!(response.headers().contains_key("x-request-id"));

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&body)?;
        assert_eq!(body.get("name"), Some(&json!("accounts")));
        assert_eq!(body.get("version"), Some(&json!(env!("CARGO_PKG_VERSION"))));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() -> anyhow::Result<()> {
        let router = App::new("accounts").into_router();
        let (status, body) = call(router, Method::DELETE, "/nothing/here?x=1").await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "cannot DELETE /nothing/here?x=1"}));
        Ok(())
    }

    #[tokio::test]
    async fn panics_become_fixed_500() -> anyhow::Result<()> {
        async fn explode() -> &'static str {
            panic!("database password is hunter2")
        }

        let router = App::new("accounts")
            .routes(Router::new().route("/boom", get(explode)))
            .into_router();
        let (status, body) = call(router, Method::GET, "/boom").await?;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": INTERNAL_ERROR}));
        Ok(())
    }

    #[tokio::test]
    async fn request_id_is_propagated() -> anyhow::Result<()> {
        let router = App::new("accounts").into_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "req-123")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok()),
            Some("req-123")
        );
        Ok(())
    }

    #[tokio::test]
    async fn serves_until_shutdown() -> anyhow::Result<()> {
        let app = App::new("accounts")
            .with_host(IpAddr::from([127, 0, 0, 1]))
            .with_port(0);
        app.serve_with_shutdown(async {}).await
    }
}
