use crate::GIT_COMMIT_HASH;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::{any::Any, sync::Arc};
use tracing::error;

pub const INTERNAL_ERROR: &str = "An error occurred while processing the request";

fn short_hash() -> &'static str {
    GIT_COMMIT_HASH.get(..7).unwrap_or(GIT_COMMIT_HASH)
}

// axum handler for health
pub async fn health(State(name): State<Arc<str>>) -> impl IntoResponse {
    let body = Json(json!({
        "name": &*name,
        "package": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build": GIT_COMMIT_HASH,
    }));

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(
        "{}:{}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_hash()
    )) {
        headers.insert("X-App", value);
    }

    (headers, body)
}

pub async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("cannot {method} {uri}")})),
    )
}

/// Turn a handler panic into a plain 500; the panic message is only logged.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    error!("request handler panicked: {detail}");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": INTERNAL_ERROR})),
    )
        .into_response()
}
