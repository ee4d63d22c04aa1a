use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokengate::{
    app::App,
    cli::actions::serve::{allowed_types, routes},
    gate::{Gate, GateConfig, TOKEN_HEADER},
    token::TokenIssuer,
};
use tower::ServiceExt;

const KEY: &str = "integration-encryption-key";
const SECRET: &str = "integration-secret";

fn issuer(secret: &str) -> Result<TokenIssuer> {
    Ok(TokenIssuer::new(
        SecretString::from(KEY.to_string()),
        SecretString::from(secret.to_string()),
    )?)
}

fn router() -> Result<Router> {
    let allowed = allowed_types(json!({
        "user": [
            {"_id": "u1", "name": "Ada", "email": "ada@example.com"},
            {"_id": "u2", "name": "Grace"}
        ]
    }))?;
    let gate = Gate::new(GateConfig {
        encryption_key: Some(SecretString::from(KEY.to_string())),
        secret: Some(SecretString::from(SECRET.to_string())),
        allowed: Some(allowed),
    })?;

    Ok(App::new("integration")
        .routes(routes())
        .enable_gate(gate)
        .into_router())
}

async fn whoami(token: Option<&str>) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().uri("/whoami");
    if let Some(token) = token {
        builder = builder.header(TOKEN_HEADER, token);
    }
    let response = router()?.oneshot(builder.body(Body::empty())?).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = serde_json::from_slice(&bytes).context("response body is not JSON")?;
    Ok((status, body))
}

#[tokio::test]
async fn issued_token_resolves_entity() -> Result<()> {
    let issued = issuer(SECRET)?.issue(&json!({"id": "u1", "typeOf": "user"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"user": {"_id": "u1", "name": "Ada", "email": "ada@example.com"}})
    );
    Ok(())
}

#[tokio::test]
async fn missing_token_is_required() -> Result<()> {
    let (status, body) = whoami(None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Token is required"}));
    Ok(())
}

#[tokio::test]
async fn garbage_token_fails_decryption() -> Result<()> {
    let (status, body) = whoami(Some("definitely not a token")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Error decrypting token"}));
    Ok(())
}

#[tokio::test]
async fn token_signed_with_other_secret_fails_verification() -> Result<()> {
    let issued = issuer("some-other-secret")?.issue(&json!({"id": "u1", "typeOf": "user"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Error verifying token"}));
    Ok(())
}

#[tokio::test]
async fn token_without_id_is_invalid_entity() -> Result<()> {
    let issued = issuer(SECRET)?.issue(&json!({"typeOf": "user"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Invalid entity object"}));
    Ok(())
}

#[tokio::test]
async fn unknown_entity_is_rejected() -> Result<()> {
    let issued = issuer(SECRET)?.issue(&json!({"id": "nobody", "typeOf": "user"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Invalid user object"}));
    Ok(())
}

#[tokio::test]
async fn disallowed_type_is_forbidden() -> Result<()> {
    let issued = issuer(SECRET)?.issue(&json!({"id": "a1", "typeOf": "admin"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body,
        json!({"error": "You are not authorized to use this route"})
    );
    Ok(())
}

#[tokio::test]
async fn expired_token_fails_verification() -> Result<()> {
    let issued = issuer(SECRET)?.issue(&json!({"id": "u1", "typeOf": "user", "exp": 1}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({"error": "Error verifying token"}));
    Ok(())
}

#[tokio::test]
async fn token_with_ttl_is_accepted_before_expiry() -> Result<()> {
    let issued = issuer(SECRET)?
        .with_ttl(std::time::Duration::from_secs(600))
        .issue(&json!({"id": "u2", "typeOf": "user"}))?;

    let (status, body) = whoami(Some(&issued.token)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"user": {"_id": "u2", "name": "Grace"}}));
    Ok(())
}

#[tokio::test]
async fn health_is_not_gated() -> Result<()> {
    let response = router()?
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["name"], "integration");
    Ok(())
}
