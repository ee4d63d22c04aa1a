use super::{Gate, Rejection, ResolvedEntity};
use async_trait::async_trait;
use axum::{
    Json,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;

/// Request header carrying the encrypted token.
pub const TOKEN_HEADER: &str = "_token";

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// Admit the request through the gate, or answer with the rejection.
///
/// The resolved entity is stored in the request extensions for [`Authenticated`].
pub async fn authenticate(
    State(gate): State<Arc<Gate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    match gate.admit(token.as_deref()).await {
        Ok(resolved) => {
            request.extensions_mut().insert(resolved);
            next.run(request).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Extractor for handlers behind [`authenticate`].
#[derive(Clone, Debug)]
pub struct Authenticated(pub ResolvedEntity);

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ResolvedEntity>()
            .cloned()
            .map(Self)
            .ok_or(Rejection::TokenRequired)
    }
}
