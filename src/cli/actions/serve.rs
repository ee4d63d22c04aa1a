use crate::{
    app::App,
    gate::{AllowedTypes, Authenticated, Gate, GateConfig, StaticRepository},
    limiter::{RateLimiter, RateLimiterConfig, ResetHandle},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Json, Router,
    response::{IntoResponse, Response},
    routing::get,
};
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};

#[derive(Debug)]
pub struct Args {
    pub name: String,
    pub port: u16,
    pub entities: PathBuf,
    pub encryption_key: SecretString,
    pub secret: SecretString,
    pub limiter: Option<RateLimiterConfig>,
}

/// Execute the serve action.
/// # Errors
/// Returns an error if the entity file, gate or limiter cannot be set up, or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let raw = std::fs::read_to_string(&args.entities)
        .with_context(|| format!("Failed to read entities file {}", args.entities.display()))?;
    let allowed = allowed_types(serde_json::from_str(&raw).context("Invalid entities JSON")?)?;

    let gate = Gate::new(GateConfig {
        encryption_key: Some(args.encryption_key),
        secret: Some(args.secret),
        allowed: Some(allowed),
    })?;

    let mut app = App::new(args.name)
        .with_port(args.port)
        .routes(routes())
        .enable_gate(gate);

    if let Some(config) = &args.limiter {
        let limiter = RateLimiter::connect(config)
            .await
            .context("Failed to set up rate limiter")?;
        app = app.enable_rate_limiter(limiter);
    }

    app.serve().await
}

/// Routes served behind the gate.
#[must_use]
pub fn routes() -> Router {
    Router::new().route("/whoami", get(whoami))
}

/// Build the registry from `{"<type>": [<record>, ...], ...}`.
///
/// # Errors
/// Returns an error if the document is not an object of arrays.
pub fn allowed_types(document: Value) -> Result<AllowedTypes> {
    let Value::Object(categories) = document else {
        return Err(anyhow!("entities file must be a JSON object"));
    };

    let mut allowed = AllowedTypes::new();
    for (category, records) in categories {
        let Value::Array(records) = records else {
            return Err(anyhow!("entities for {category} must be an array"));
        };
        let repository = StaticRepository::new(records);
        info!(category = %category, records = repository.len(), "loaded entities");
        allowed = allowed.allow(category, Arc::new(repository));
    }

    Ok(allowed)
}

// A successful call clears the caller's rate-limit record.
async fn whoami(
    Authenticated(resolved): Authenticated,
    reset: Option<Extension<ResetHandle>>,
) -> Response {
    if let Some(Extension(handle)) = reset {
        if let Err(err) = handle.reset().await {
            error!("Failed to reset rate limiter record: {err:#}");
        }
    }

    let mut body = Map::new();
    body.insert(
        resolved.category().to_string(),
        Value::Object(resolved.into_entity().into_map()),
    );
    Json(Value::Object(body)).into_response()
}

fn log_startup_args(args: &Args) {
    let limiter = args.limiter.as_ref().map_or_else(
        || "disabled".to_string(),
        |config| {
            format!(
                "{} (free retries {}, wait {}..{} ms)",
                config.environment,
                config.free_retries,
                config.min_wait.as_millis(),
                config.max_wait.as_millis()
            )
        },
    );
    let entries = [
        ("name", args.name.clone()),
        ("port", args.port.to_string()),
        ("entities", args.entities.display().to_string()),
        ("rate_limiter", limiter),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "tokengate {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
