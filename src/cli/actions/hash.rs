use crate::crypto;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug)]
pub struct Args {
    pub text: SecretString,
    pub cost: u32,
}

/// Print the bcrypt hash of the given text.
/// # Errors
/// Returns an error if hashing fails.
pub async fn execute(args: Args) -> Result<()> {
    let hashed = crypto::hash(args.text.expose_secret(), args.cost)
        .await
        .context("Failed to hash text")?;
    println!("{hashed}");
    Ok(())
}
