use crate::token::{IssuedToken, TokenIssuer};
use anyhow::{Context, Result};
use secrecy::SecretString;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub claims: Value,
    pub ttl: Option<Duration>,
    pub encryption_key: SecretString,
    pub secret: SecretString,
}

fn issue(args: Args) -> Result<IssuedToken> {
    let mut issuer = TokenIssuer::new(args.encryption_key, args.secret)?;
    if let Some(ttl) = args.ttl {
        issuer = issuer.with_ttl(ttl);
    }

    issuer.issue(&args.claims).context("Failed to issue token")
}

/// Print the issued token as JSON.
/// # Errors
/// Returns an error if the keys are invalid or the claims cannot be sealed.
pub fn execute(args: Args) -> Result<()> {
    debug!(ttl = ?args.ttl, "issuing token");
    let issued = issue(args)?;
    let json = serde_json::to_string_pretty(&issued)?;
    println!("{json}");
    Ok(())
}
