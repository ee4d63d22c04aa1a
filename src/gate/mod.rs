//! Admission gate.
//!
//! Flow Overview: every protected request runs three stages in order and stops at
//! the first failure.
//!
//! 1. `decrypt`: open the token header with the encryption key. The result is a
//!    signed artifact that only the next stage can read.
//! 2. `verify`: check the HS256 signature (and `exp`, when present) with the
//!    signing secret, and require an object with a non-null `id`.
//! 3. `resolve`: look up `typeOf` in the allowed-types registry and load the
//!    entity by `id`. The claims are consumed here; only the resolved entity
//!    moves on.
//!
//! The gate keeps no state between requests. Rejections from stages 1 and 2 and
//! lookup failures in stage 3 render as 401; a category outside the registry
//! renders as 403.

mod middleware;
mod registry;

pub use middleware::{Authenticated, TOKEN_HEADER, authenticate};
pub use registry::{AllowedTypes, ENTITY_ID_FIELD, Entity, EntityRepository, StaticRepository};

use crate::{
    crypto::{self, CryptoError, MIN_KEY_LENGTH},
    error::ConfigError,
    token::{ID_CLAIM, TYPE_CLAIM},
};
use axum::http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, instrument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Decrypt,
    Verify,
    Resolve,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decrypt => "decrypt",
            Self::Verify => "verify",
            Self::Resolve => "resolve",
        }
    }
}

/// Terminal outcome of a failed gate stage. The `Display` text is the exact
/// message returned to the client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Token is required")]
    TokenRequired,
    #[error("Error decrypting token")]
    DecryptError,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Error verifying token")]
    VerifyError,
    #[error("Invalid {} object", .category.as_deref().unwrap_or("entity"))]
    InvalidEntity { category: Option<String> },
    #[error("No allowed types specified")]
    NoAllowedTypes,
    #[error("You are not authorized to use this route")]
    Forbidden,
    #[error("An error occurred while verifying {category}")]
    ResolutionError { category: String },
}

impl Rejection {
    /// Stage that produced the rejection.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::TokenRequired | Self::DecryptError | Self::InvalidToken => Stage::Decrypt,
            Self::VerifyError | Self::InvalidEntity { category: None } => Stage::Verify,
            Self::InvalidEntity { category: Some(_) }
            | Self::NoAllowedTypes
            | Self::Forbidden
            | Self::ResolutionError { .. } => Stage::Resolve,
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Gate configuration. Every field is optional so a partially configured gate
/// still fails closed per request instead of letting traffic through.
#[derive(Debug, Default)]
pub struct GateConfig {
    pub encryption_key: Option<SecretString>,
    pub secret: Option<SecretString>,
    pub allowed: Option<AllowedTypes>,
}

/// Output of the decrypt stage: the signed artifact, readable only by [`Gate::verify`].
pub struct Decrypted {
    signed: String,
}

impl fmt::Debug for Decrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Decrypted(..)")
    }
}

/// Output of the verify stage: authenticated claims, consumed by [`Gate::resolve`].
#[derive(Debug)]
pub struct Verified {
    claims: Map<String, Value>,
}

impl Verified {
    #[must_use]
    pub fn id(&self) -> &Value {
        self.claims.get(ID_CLAIM).unwrap_or(&Value::Null)
    }

    #[must_use]
    pub fn type_of(&self) -> Option<&str> {
        self.claims.get(TYPE_CLAIM).and_then(Value::as_str)
    }
}

/// The entity a request was admitted as, stored in the request extensions under
/// the category it was registered with.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEntity {
    category: String,
    entity: Entity,
}

impl ResolvedEntity {
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// The entity, only if it was resolved for `category`.
    #[must_use]
    pub fn slot(&self, category: &str) -> Option<&Entity> {
        (self.category == category).then_some(&self.entity)
    }

    #[must_use]
    pub fn into_entity(self) -> Entity {
        self.entity
    }
}

pub struct Gate {
    encryption_key: Option<SecretString>,
    secret: Option<SecretString>,
    allowed: Option<AllowedTypes>,
    validation: Validation,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("encryption_key", &self.encryption_key.is_some())
            .field("secret", &self.secret.is_some())
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// # Errors
    /// Returns `ConfigError::EncryptionKeyTooShort` if a key is configured but shorter
    /// than [`MIN_KEY_LENGTH`] characters.
    pub fn new(config: GateConfig) -> Result<Self, ConfigError> {
        let too_short = config
            .encryption_key
            .as_ref()
            .is_some_and(|key| key.expose_secret().chars().count() < MIN_KEY_LENGTH);
        if too_short {
            return Err(ConfigError::EncryptionKeyTooShort {
                min: MIN_KEY_LENGTH,
            });
        }

        // Expiry is enforced only when the issuer embedded one.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        Ok(Self {
            encryption_key: config.encryption_key,
            secret: config.secret,
            allowed: config.allowed,
            validation,
        })
    }

    /// Run all three stages for the raw token header value.
    ///
    /// # Errors
    /// Returns the [`Rejection`] of the first stage that fails.
    #[instrument(skip_all)]
    pub async fn admit(&self, token: Option<&str>) -> Result<ResolvedEntity, Rejection> {
        let outcome = match self.decrypt(token).and_then(|d| self.verify(d)) {
            Ok(verified) => self.resolve(verified).await,
            Err(rejection) => Err(rejection),
        };

        if let Err(rejection) = &outcome {
            debug!(
                stage = rejection.stage().as_str(),
                reason = %rejection,
                "request rejected by gate"
            );
        }

        outcome
    }

    /// Stage 1: decrypt the token header.
    ///
    /// # Errors
    /// `TokenRequired` if the header or key is missing, `InvalidToken` if the
    /// ciphertext fails authentication or opens to an empty value, `DecryptError`
    /// if it cannot be decoded at all.
    pub fn decrypt(&self, token: Option<&str>) -> Result<Decrypted, Rejection> {
        let (Some(token), Some(key)) = (token.filter(|t| !t.is_empty()), &self.encryption_key)
        else {
            return Err(Rejection::TokenRequired);
        };

        match crypto::decrypt::<Value>(key.expose_secret(), token) {
            Ok(Value::String(signed)) if !signed.is_empty() => Ok(Decrypted { signed }),
            Ok(_) | Err(CryptoError::Tampered) => Err(Rejection::InvalidToken),
            Err(_) => Err(Rejection::DecryptError),
        }
    }

    /// Stage 2: verify the signed artifact and require an `id` claim.
    ///
    /// # Errors
    /// `TokenRequired` if no secret is configured, `VerifyError` on a bad
    /// signature or expired token, `InvalidEntity` when the claims carry no `id`.
    pub fn verify(&self, decrypted: Decrypted) -> Result<Verified, Rejection> {
        let Some(secret) = self
            .secret
            .as_ref()
            .filter(|s| !s.expose_secret().is_empty())
        else {
            return Err(Rejection::TokenRequired);
        };

        let data = decode::<Value>(
            &decrypted.signed,
            &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            &self.validation,
        )
        .map_err(|_| Rejection::VerifyError)?;

        match data.claims {
            Value::Object(claims) if claims.get(ID_CLAIM).is_some_and(|id| !id.is_null()) => {
                Ok(Verified { claims })
            }
            _ => Err(Rejection::InvalidEntity { category: None }),
        }
    }

    /// Stage 3: resolve the entity through the registry.
    ///
    /// # Errors
    /// `NoAllowedTypes` without a registry, `Forbidden` for categories outside it,
    /// `ResolutionError` when the repository fails, `InvalidEntity` when it returns
    /// nothing usable.
    pub async fn resolve(&self, verified: Verified) -> Result<ResolvedEntity, Rejection> {
        let Some(allowed) = self.allowed.as_ref().filter(|a| !a.is_empty()) else {
            return Err(Rejection::NoAllowedTypes);
        };

        let Some((category, repository)) = verified
            .type_of()
            .and_then(|t| allowed.get(t).map(|repo| (t.to_string(), repo)))
        else {
            return Err(Rejection::Forbidden);
        };

        let Verified { mut claims } = verified;
        let id = claims.remove(ID_CLAIM).unwrap_or(Value::Null);
        drop(claims);

        let record = repository.find_by_id(&id).await.map_err(|err| {
            error!(category = %category, "entity lookup failed: {err:#}");
            Rejection::ResolutionError {
                category: category.clone(),
            }
        })?;

        match record.and_then(Entity::from_record) {
            Some(entity) => Ok(ResolvedEntity { category, entity }),
            None => Err(Rejection::InvalidEntity {
                category: Some(category),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    const SECRET: &str = "s1";

    fn key() -> String {
        "k".repeat(16)
    }

    struct FailingRepository;

    #[async_trait]
    impl EntityRepository for FailingRepository {
        async fn find_by_id(&self, _id: &Value) -> anyhow::Result<Option<Value>> {
            Err(anyhow::anyhow!("connection refused: db.internal:5432"))
        }
    }

    struct ShapelessRepository;

    #[async_trait]
    impl EntityRepository for ShapelessRepository {
        async fn find_by_id(&self, id: &Value) -> anyhow::Result<Option<Value>> {
            Ok(Some(json!({"id": id, "name": "missing _id"})))
        }
    }

    fn users() -> Arc<dyn EntityRepository> {
        Arc::new(StaticRepository::new(vec![json!({"_id": "u1", "name": "A"})]))
    }

    fn gate_with(allowed: Option<AllowedTypes>) -> Result<Gate, ConfigError> {
        Gate::new(GateConfig {
            encryption_key: Some(SecretString::from(key())),
            secret: Some(SecretString::from(SECRET)),
            allowed,
        })
    }

    fn gate() -> Result<Gate, ConfigError> {
        gate_with(Some(AllowedTypes::new().allow("user", users())))
    }

    fn token_for(claims: &Value) -> anyhow::Result<String> {
        Ok(token::issue(claims, &key(), SECRET)?.token)
    }

    #[tokio::test]
    async fn resolves_issued_token_end_to_end() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;

        let resolved = gate.admit(Some(&token)).await?;
        assert_eq!(resolved.category(), "user");
        assert_eq!(resolved.entity().id(), &json!("u1"));
        assert_eq!(
            Value::Object(resolved.entity().as_map().clone()),
            json!({"_id": "u1", "name": "A"})
        );
        assert!(resolved.slot("user").is_some());
        assert!(resolved.slot("admin").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stages_compose_in_order() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user", "extra": true}))?;

        let decrypted = gate.decrypt(Some(&token))?;
        let verified = gate.verify(decrypted)?;
        assert_eq!(verified.id(), &json!("u1"));
        assert_eq!(verified.type_of(), Some("user"));

        let resolved = gate.resolve(verified).await?;
        assert!(resolved.entity().get("extra").is_none());
        Ok(())
    }

    #[test]
    fn rejects_short_key_at_construction() {
        let result = Gate::new(GateConfig {
            encryption_key: Some(SecretString::from("short-key")),
            ..GateConfig::default()
        });
        assert!(matches!(
            result,
            Err(ConfigError::EncryptionKeyTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn missing_header_or_key_requires_token() -> anyhow::Result<()> {
        let gate = gate()?;
        assert_eq!(gate.admit(None).await, Err(Rejection::TokenRequired));
        assert_eq!(gate.admit(Some("")).await, Err(Rejection::TokenRequired));

        let keyless = Gate::new(GateConfig {
            secret: Some(SecretString::from(SECRET)),
            ..GateConfig::default()
        })?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;
        assert_eq!(
            keyless.admit(Some(&token)).await,
            Err(Rejection::TokenRequired)
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_secret_requires_token_at_verify() -> anyhow::Result<()> {
        let gate = Gate::new(GateConfig {
            encryption_key: Some(SecretString::from(key())),
            secret: None,
            allowed: Some(AllowedTypes::new().allow("user", users())),
        })?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;

        let rejection = gate.admit(Some(&token)).await.err();
        assert_eq!(rejection, Some(Rejection::TokenRequired));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_and_foreign_tokens() -> anyhow::Result<()> {
        let gate = gate()?;
        assert_eq!(
            gate.admit(Some("%%%not-a-token%%%")).await,
            Err(Rejection::DecryptError)
        );

        let foreign = token::issue(
            &json!({"id": "u1", "typeOf": "user"}),
            "a-completely-different-key",
            SECRET,
        )?;
        assert_eq!(
            gate.admit(Some(&foreign.token)).await,
            Err(Rejection::InvalidToken)
        );
        Ok(())
    }

    #[tokio::test]
    async fn encrypted_non_token_payload_is_invalid() -> anyhow::Result<()> {
        let gate = gate()?;
        let empty = crypto::encrypt(&key(), "")?;
        assert_eq!(gate.admit(Some(&empty)).await, Err(Rejection::InvalidToken));

        let number = crypto::encrypt(&key(), &42)?;
        assert_eq!(gate.admit(Some(&number)).await, Err(Rejection::InvalidToken));

        let unsigned = crypto::encrypt(&key(), "header.payload.signature")?;
        assert_eq!(gate.admit(Some(&unsigned)).await, Err(Rejection::VerifyError));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_secret_fails_verification() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token::issue(&json!({"id": "u1", "typeOf": "user"}), &key(), "s2")?;
        assert_eq!(
            gate.admit(Some(&token.token)).await,
            Err(Rejection::VerifyError)
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_fails_verification() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user", "exp": 1_000}))?;
        assert_eq!(gate.admit(Some(&token)).await, Err(Rejection::VerifyError));
        Ok(())
    }

    #[tokio::test]
    async fn claims_without_id_are_invalid() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token_for(&json!({"typeOf": "user"}))?;
        let rejection = gate.admit(Some(&token)).await.err();
        assert_eq!(rejection, Some(Rejection::InvalidEntity { category: None }));
        assert_eq!(
            rejection.map(|r| r.to_string()),
            Some("Invalid entity object".to_string())
        );

        let null_id = token_for(&json!({"id": null, "typeOf": "user"}))?;
        assert_eq!(
            gate.admit(Some(&null_id)).await,
            Err(Rejection::InvalidEntity { category: None })
        );

        let scalar = token_for(&json!("just a string"))?;
        assert_eq!(
            gate.admit(Some(&scalar)).await,
            Err(Rejection::InvalidEntity { category: None })
        );
        Ok(())
    }

    #[tokio::test]
    async fn flipped_characters_never_resolve() -> anyhow::Result<()> {
        let gate = gate()?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;

        for index in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            if let Some(byte) = bytes.get_mut(index) {
                *byte = if *byte == b'A' { b'B' } else { b'A' };
            }
            let tampered = String::from_utf8(bytes)?;

            let rejection = gate
                .admit(Some(&tampered))
                .await
                .err()
                .ok_or_else(|| anyhow::anyhow!("tampered token at {index} was admitted"))?;
            assert!(matches!(rejection.stage(), Stage::Decrypt | Stage::Verify));
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_registry() -> anyhow::Result<()> {
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;

        let none = gate_with(None)?;
        assert_eq!(none.admit(Some(&token)).await, Err(Rejection::NoAllowedTypes));

        let empty = gate_with(Some(AllowedTypes::new()))?;
        assert_eq!(
            empty.admit(Some(&token)).await,
            Err(Rejection::NoAllowedTypes)
        );
        Ok(())
    }

    #[tokio::test]
    async fn unregistered_category_is_forbidden() -> anyhow::Result<()> {
        let gate = gate_with(Some(
            AllowedTypes::new()
                .allow("user", users())
                .allow("broken", Arc::new(FailingRepository)),
        ))?;

        for claims in [
            json!({"id": "u1", "typeOf": "admin"}),
            json!({"id": "u1"}),
            json!({"id": "u1", "typeOf": 7}),
        ] {
            let rejection = gate.admit(Some(&token_for(&claims)?)).await.err();
            assert_eq!(rejection, Some(Rejection::Forbidden));
            assert_eq!(
                rejection.map(|r| r.status()),
                Some(StatusCode::FORBIDDEN)
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn repository_failure_is_a_resolution_error() -> anyhow::Result<()> {
        let gate = gate_with(Some(
            AllowedTypes::new().allow("user", Arc::new(FailingRepository)),
        ))?;
        let token = token_for(&json!({"id": "u1", "typeOf": "user"}))?;

        let rejection = gate.admit(Some(&token)).await.err();
        assert_eq!(
            rejection,
            Some(Rejection::ResolutionError {
                category: "user".to_string()
            })
        );
        let message = rejection.map(|r| r.to_string()).unwrap_or_default();
        assert_eq!(message, "An error occurred while verifying user");
        assert!(!message.contains("db.internal"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_or_malformed_entity_is_invalid() -> anyhow::Result<()> {
        let gate = gate_with(Some(
            AllowedTypes::new()
                .allow("user", users())
                .allow("device", Arc::new(ShapelessRepository)),
        ))?;

        let missing = token_for(&json!({"id": "nobody", "typeOf": "user"}))?;
        assert_eq!(
            gate.admit(Some(&missing)).await,
            Err(Rejection::InvalidEntity {
                category: Some("user".to_string())
            })
        );

        let shapeless = token_for(&json!({"id": "d1", "typeOf": "device"}))?;
        let rejection = gate.admit(Some(&shapeless)).await.err();
        assert_eq!(
            rejection.map(|r| r.to_string()),
            Some("Invalid device object".to_string())
        );
        Ok(())
    }

    #[test]
    fn rejection_status_and_stage() {
        assert_eq!(Rejection::TokenRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Rejection::NoAllowedTypes.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Rejection::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(Rejection::InvalidToken.stage(), Stage::Decrypt);
        assert_eq!(Rejection::VerifyError.stage(), Stage::Verify);
        assert_eq!(
            Rejection::InvalidEntity {
                category: Some("user".to_string())
            }
            .stage(),
            Stage::Resolve
        );
    }

    #[test]
    fn debug_output_hides_secrets() -> anyhow::Result<()> {
        let gate = gate()?;
        let debug = format!("{gate:?}");
        assert!(!debug.contains(&key()));
        assert!(!debug.contains("\"s1\""));
        Ok(())
    }
}
