//! Token issuance.
//!
//! A token is an HS256 JWT over the caller's claims, encrypted with
//! [`crate::crypto::encrypt`]. Reading one back is only possible through the
//! [`crate::gate::Gate`], which also verifies the signature and resolves the entity.

use crate::{
    crypto::{self, CryptoError, MIN_KEY_LENGTH},
    error::ConfigError,
};
use jsonwebtoken::{EncodingKey, Header, encode, get_current_timestamp};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Claim holding the entity identifier.
pub const ID_CLAIM: &str = "id";
/// Claim holding the entity category used to pick a repository.
pub const TYPE_CLAIM: &str = "typeOf";
/// Field non-object payloads are wrapped under.
pub const DATA_CLAIM: &str = "data";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("claims could not be serialized")]
    Claims(#[from] serde_json::Error),
    #[error("failed to sign claims")]
    Sign(#[from] jsonwebtoken::errors::Error),
    #[error("failed to encrypt signed claims")]
    Encrypt(#[from] CryptoError),
}

/// An issued token together with the public fields of the subject it was issued for.
///
/// Serializes flat (`{"name": .., "token": ..}`) so it can be returned to the
/// client as is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedToken {
    #[serde(flatten)]
    pub public: Map<String, Value>,
    pub token: String,
}

/// Entity-like inputs that carry both the claims to embed and a public projection
/// safe to hand back to the caller alongside the token.
pub trait PublicProfile {
    fn claims(&self) -> Value;

    fn public_fields(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Issue a token for arbitrary data.
///
/// Non-object data is wrapped as `{"data": <value>}` before signing.
///
/// # Errors
/// Returns an error if the secret is empty, the key is too short, or signing fails.
pub fn issue<T: Serialize + ?Sized>(
    data: &T,
    encryption_key: &str,
    secret: &str,
) -> Result<IssuedToken, TokenError> {
    let claims = serde_json::to_value(data)?;
    let token = seal(claims, encryption_key, secret, None)?;

    Ok(IssuedToken {
        public: Map::new(),
        token,
    })
}

/// Holds the key material for issuing tokens, plus the optional expiry hook.
pub struct TokenIssuer {
    encryption_key: SecretString,
    secret: SecretString,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// # Errors
    /// Returns a `ConfigError` if the key is shorter than [`MIN_KEY_LENGTH`] or the secret is empty.
    pub fn new(encryption_key: SecretString, secret: SecretString) -> Result<Self, ConfigError> {
        if encryption_key.expose_secret().chars().count() < MIN_KEY_LENGTH {
            return Err(ConfigError::EncryptionKeyTooShort {
                min: MIN_KEY_LENGTH,
            });
        }
        if secret.expose_secret().is_empty() {
            return Err(ConfigError::EmptySecret);
        }

        Ok(Self {
            encryption_key,
            secret,
            ttl: None,
        })
    }

    /// Embed an `exp` claim `ttl` after issuance. The gate rejects the token once it passes.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// # Errors
    /// Returns an error if the claims cannot be serialized, signed or encrypted.
    pub fn issue<T: Serialize + ?Sized>(&self, data: &T) -> Result<IssuedToken, TokenError> {
        let claims = serde_json::to_value(data)?;
        let token = self.seal(claims)?;

        Ok(IssuedToken {
            public: Map::new(),
            token,
        })
    }

    /// Issue a token for `subject` and return it merged with the subject's public fields.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be signed or encrypted.
    pub fn issue_for<P: PublicProfile + ?Sized>(
        &self,
        subject: &P,
    ) -> Result<IssuedToken, TokenError> {
        let token = self.seal(subject.claims())?;

        Ok(IssuedToken {
            public: subject.public_fields(),
            token,
        })
    }

    fn seal(&self, claims: Value) -> Result<String, TokenError> {
        seal(
            claims,
            self.encryption_key.expose_secret(),
            self.secret.expose_secret(),
            self.ttl,
        )
    }
}

fn seal(
    claims: Value,
    encryption_key: &str,
    secret: &str,
    ttl: Option<Duration>,
) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }

    let mut claims = match claims {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(DATA_CLAIM.to_string(), other);
            map
        }
    };

    let now = get_current_timestamp();
    claims.entry("iat").or_insert_with(|| Value::from(now));
    if let Some(ttl) = ttl {
        claims.insert("exp".to_string(), Value::from(now.saturating_add(ttl.as_secs())));
    }

    let signed = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(crypto::encrypt(encryption_key, &signed)?)
}
