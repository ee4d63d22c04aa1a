use thiserror::Error;

/// Errors raised while wiring the gate, the token issuer or the rate limiter.
///
/// These surface at construction time and must stop the process from starting;
/// they are never produced while serving a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("encryption key must be at least {min} characters")]
    EncryptionKeyTooShort { min: usize },
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("rate limiter store host and port must be set in production")]
    MissingStoreAddress,
    #[error("rate limiter min wait ({min_ms}ms) exceeds max wait ({max_ms}ms)")]
    InvalidWaitBounds { min_ms: u128, max_ms: u128 },
    #[error("rate limiter wait and lifetime must be greater than zero")]
    ZeroDuration,
    #[error("unknown backing environment: {0}")]
    UnknownEnvironment(String),
    #[error("invalid rate limiter store address: {0}")]
    InvalidStoreAddress(String),
    #[error("rate limiter store is unreachable")]
    StoreUnreachable(#[source] redis::RedisError),
}
