use crate::{
    cli::{
        actions::{Action, hash, issue, serve},
        commands::{self, gate as gate_args, limiter as limiter_args},
    },
    limiter::{Environment, RateLimiterConfig},
};
use anyhow::{Context, Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use serde_json::Value;
use std::{path::PathBuf, time::Duration};

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some((commands::CMD_SERVE, sub)) => serve_args(sub).map(Action::Serve),
        Some((commands::CMD_ISSUE, sub)) => issue_args(sub).map(Action::Issue),
        Some((commands::CMD_HASH, sub)) => hash_args(sub).map(Action::Hash),
        Some((other, _)) => Err(anyhow!("unknown command: {other}")),
        None => Err(anyhow!("missing command")),
    }
}

fn secret(matches: &ArgMatches, id: &str) -> Result<SecretString> {
    matches
        .get_one::<String>(id)
        .map(|value| SecretString::from(value.clone()))
        .with_context(|| format!("missing required argument: --{id}"))
}

fn serve_args(matches: &ArgMatches) -> Result<serve::Args> {
    let name = matches
        .get_one::<String>(commands::ARG_NAME)
        .cloned()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let port = matches.get_one::<u16>(commands::ARG_PORT).copied().unwrap_or(8080);
    let entities = matches
        .get_one::<String>(commands::ARG_ENTITIES)
        .map(PathBuf::from)
        .context("missing required argument: --entities")?;

    let limiter = if matches.get_flag(limiter_args::ARG_DISABLE) {
        None
    } else {
        Some(limiter_config(matches)?)
    };

    Ok(serve::Args {
        name,
        port,
        entities,
        encryption_key: secret(matches, gate_args::ARG_ENCRYPTION_KEY)?,
        secret: secret(matches, gate_args::ARG_SECRET)?,
        limiter,
    })
}

fn limiter_config(matches: &ArgMatches) -> Result<RateLimiterConfig> {
    let environment = matches
        .get_one::<String>(limiter_args::ARG_ENVIRONMENT)
        .map_or(Ok(Environment::Development), |env| env.parse::<Environment>())
        .context("invalid TOKENGATE_LIMITER_ENV")?;

    let millis = |id: &str| {
        matches
            .get_one::<u64>(id)
            .copied()
            .map(Duration::from_millis)
            .with_context(|| format!("missing argument: --{id}"))
    };

    let mut config = RateLimiterConfig::new()
        .with_environment(environment)
        .with_wait(millis(limiter_args::ARG_MIN_WAIT)?, millis(limiter_args::ARG_MAX_WAIT)?)
        .with_refresh_on_request(matches.get_flag(limiter_args::ARG_REFRESH));

    if let Some(retries) = matches.get_one::<u64>(limiter_args::ARG_FREE_RETRIES) {
        config = config.with_free_retries(*retries);
    }
    if let Some(lifetime) = matches.get_one::<u64>(limiter_args::ARG_LIFETIME) {
        config = config.with_lifetime(Duration::from_secs(*lifetime));
    }
    config.store_host = matches.get_one::<String>(limiter_args::ARG_STORE_HOST).cloned();
    config.store_port = matches.get_one::<u16>(limiter_args::ARG_STORE_PORT).copied();

    config.validate()?;

    Ok(config)
}

fn issue_args(matches: &ArgMatches) -> Result<issue::Args> {
    let raw = matches
        .get_one::<String>(commands::ARG_CLAIMS)
        .context("missing required argument: claims")?;
    let claims: Value = serde_json::from_str(raw).context("claims must be valid JSON")?;

    Ok(issue::Args {
        claims,
        ttl: matches
            .get_one::<u64>(commands::ARG_TTL)
            .copied()
            .map(Duration::from_secs),
        encryption_key: secret(matches, gate_args::ARG_ENCRYPTION_KEY)?,
        secret: secret(matches, gate_args::ARG_SECRET)?,
    })
}

fn hash_args(matches: &ArgMatches) -> Result<hash::Args> {
    let text = secret(matches, commands::ARG_TEXT)?;
    let cost = matches
        .get_one::<u32>(commands::ARG_COST)
        .copied()
        .unwrap_or(crate::crypto::DEFAULT_COST);

    Ok(hash::Args { text, cost })
}
