//! Per-client admission control.
//!
//! Flow Overview:
//! 1) Key the request by client address.
//! 2) Evaluate the client's record against the backoff table in one atomic store call.
//! 3) Admit (recording the attempt) or refuse with the time left until the next
//!    allowed attempt.
//!
//! The first `free_retries` attempts are never delayed. After that each attempt has to
//! wait a Fibonacci-like delay (`min, min, 2min, 3min, 5min, ...`, capped at `max_wait`)
//! measured from the last admitted attempt. Refused attempts are not counted. Records
//! expire `lifetime` after the first request, or after the last one when
//! `refresh_on_request` is set, and the client then starts over.

mod memory;
mod middleware;
mod redis;
mod store;

pub use memory::MemoryStore;
pub use middleware::{client_key, prevent};
pub use self::redis::RedisStore;
pub use store::{AttemptRecord, AttemptStore, StoreError};

use crate::error::ConfigError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{error, instrument, warn};

pub const DEFAULT_FREE_RETRIES: u64 = 1000;
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Where rate-limit records live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    /// Single process, records in local memory.
    #[default]
    Development,
    /// Several processes sharing records in Redis.
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub environment: Environment,
    pub store_host: Option<String>,
    pub store_port: Option<u16>,
    pub free_retries: u64,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub lifetime: Duration,
    pub refresh_on_request: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            store_host: None,
            store_port: None,
            free_retries: DEFAULT_FREE_RETRIES,
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            lifetime: DEFAULT_LIFETIME,
            refresh_on_request: false,
        }
    }
}

impl RateLimiterConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_store(mut self, host: impl Into<String>, port: u16) -> Self {
        self.store_host = Some(host.into());
        self.store_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_free_retries(mut self, free_retries: u64) -> Self {
        self.free_retries = free_retries;
        self
    }

    #[must_use]
    pub fn with_wait(mut self, min_wait: Duration, max_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_refresh_on_request(mut self, refresh: bool) -> Self {
        self.refresh_on_request = refresh;
        self
    }

    /// # Errors
    /// Returns a `ConfigError` for zero durations, `min_wait > max_wait`, or a
    /// production environment without a store host and port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_backoff()?;
        if self.environment == Environment::Production {
            let host_set = self.store_host.as_deref().is_some_and(|h| !h.trim().is_empty());
            if !host_set || self.store_port.is_none() {
                return Err(ConfigError::MissingStoreAddress);
            }
        }
        Ok(())
    }

    fn validate_backoff(&self) -> Result<(), ConfigError> {
        if self.min_wait.is_zero() || self.max_wait.is_zero() || self.lifetime.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.min_wait > self.max_wait {
            return Err(ConfigError::InvalidWaitBounds {
                min_ms: self.min_wait.as_millis(),
                max_ms: self.max_wait.as_millis(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.free_retries,
            self.min_wait,
            self.max_wait,
            self.lifetime,
            self.refresh_on_request,
        )
    }
}

/// Outcome of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Admitted; `attempts` counts this one.
    Admitted { attempts: u64 },
    Throttled { retry_after_ms: u64 },
}

/// The delay schedule and record lifetime, shared by every store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    free_retries: u64,
    delays_ms: Vec<u64>,
    lifetime_ms: u64,
    refresh_on_request: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Backoff {
    #[must_use]
    pub fn new(
        free_retries: u64,
        min_wait: Duration,
        max_wait: Duration,
        lifetime: Duration,
        refresh_on_request: bool,
    ) -> Self {
        let min = millis(min_wait).max(1);
        let max = millis(max_wait).max(min);

        let mut delays_ms = vec![min];
        while let Some(&last) = delays_ms.last() {
            if last >= max {
                break;
            }
            let before = delays_ms
                .len()
                .checked_sub(2)
                .and_then(|i| delays_ms.get(i))
                .copied()
                .unwrap_or(0);
            delays_ms.push(last.saturating_add(before));
        }
        if let Some(last) = delays_ms.last_mut() {
            *last = max;
        }

        Self {
            free_retries,
            delays_ms,
            lifetime_ms: millis(lifetime),
            refresh_on_request,
        }
    }

    #[must_use]
    pub fn free_retries(&self) -> u64 {
        self.free_retries
    }

    #[must_use]
    pub fn delays_ms(&self) -> &[u64] {
        &self.delays_ms
    }

    #[must_use]
    pub fn lifetime_ms(&self) -> u64 {
        self.lifetime_ms
    }

    #[must_use]
    pub fn refresh_on_request(&self) -> bool {
        self.refresh_on_request
    }

    fn max_delay_ms(&self) -> u64 {
        self.delays_ms.last().copied().unwrap_or(0)
    }

    /// Wait required after the last admitted attempt once `count` attempts were admitted.
    #[must_use]
    pub fn delay_ms(&self, count: u64) -> u64 {
        if count == 0 || count < self.free_retries {
            return 0;
        }
        usize::try_from(count - self.free_retries)
            .ok()
            .and_then(|i| self.delays_ms.get(i))
            .copied()
            .unwrap_or_else(|| self.max_delay_ms())
    }

    /// Decide on an attempt given the live (unexpired) record, if any.
    #[must_use]
    pub fn evaluate(&self, record: Option<&AttemptRecord>, now_ms: u64) -> Decision {
        let Some(record) = record else {
            return Decision::Admitted { attempts: 1 };
        };

        let next_allowed = record.last_ms.saturating_add(self.delay_ms(record.count));
        if next_allowed <= now_ms {
            Decision::Admitted {
                attempts: record.count.saturating_add(1),
            }
        } else {
            Decision::Throttled {
                retry_after_ms: next_allowed - now_ms,
            }
        }
    }

    /// Record an admitted attempt.
    #[must_use]
    pub fn advance(&self, record: Option<AttemptRecord>, now_ms: u64) -> AttemptRecord {
        let record = record.unwrap_or(AttemptRecord {
            count: 0,
            first_ms: now_ms,
            last_ms: now_ms,
        });
        AttemptRecord {
            count: record.count.saturating_add(1),
            first_ms: record.first_ms,
            last_ms: now_ms,
        }
    }

    /// Absolute expiry of `record`, ms since the Unix epoch.
    #[must_use]
    pub fn expires_at_ms(&self, record: &AttemptRecord) -> u64 {
        let anchor = if self.refresh_on_request {
            record.last_ms
        } else {
            record.first_ms
        };
        anchor.saturating_add(self.lifetime_ms)
    }
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Too many requests in this time frame.")]
    Throttled { retry_after: Duration },
    #[error("Rate limiter unavailable")]
    Store(#[source] StoreError),
}

impl LimiterError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        match self {
            Self::Throttled { retry_after } => {
                let seconds = whole_seconds(retry_after);
                let body = json!({
                    "error": message,
                    "retry_after": seconds,
                });
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(seconds));
                response
            }
            Self::Store(_) => (status, Json(json!({"error": message}))).into_response(),
        }
    }
}

/// Clears one client's record. Every admitted request carries one in its extensions.
#[derive(Clone)]
pub struct ResetHandle {
    store: Arc<dyn AttemptStore>,
    key: String,
}

impl fmt::Debug for ResetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetHandle")
            .field("store", &self.store.name())
            .field("key", &self.key)
            .finish()
    }
}

impl ResetHandle {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// # Errors
    /// Returns a `StoreError` if the store cannot delete the record.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.reset(&self.key).await
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn AttemptStore>,
    backoff: Backoff,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or_default()
}

impl RateLimiter {
    /// Validate `config` and open the store it selects.
    ///
    /// # Errors
    /// Returns a `ConfigError` for invalid settings or an unreachable production store.
    pub async fn connect(config: &RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let store: Arc<dyn AttemptStore> = match config.environment {
            Environment::Development => Arc::new(MemoryStore::new()),
            Environment::Production => {
                let (Some(host), Some(port)) = (config.store_host.as_deref(), config.store_port)
                else {
                    return Err(ConfigError::MissingStoreAddress);
                };
                Arc::new(RedisStore::connect(host, port).await?)
            }
        };

        Ok(Self {
            store,
            backoff: config.backoff(),
        })
    }

    /// Use a caller-provided store; the environment and store address are ignored.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the wait or lifetime settings are invalid.
    pub fn with_store(
        store: Arc<dyn AttemptStore>,
        config: &RateLimiterConfig,
    ) -> Result<Self, ConfigError> {
        config.validate_backoff()?;
        Ok(Self {
            store,
            backoff: config.backoff(),
        })
    }

    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// # Errors
    /// `Throttled` while the client must wait, `Store` when the store fails.
    pub async fn check(&self, key: &str) -> Result<ResetHandle, LimiterError> {
        self.check_at(key, now_ms()).await
    }

    /// [`RateLimiter::check`] with an explicit clock.
    ///
    /// # Errors
    /// `Throttled` while the client must wait, `Store` when the store fails.
    #[instrument(skip(self))]
    pub async fn check_at(&self, key: &str, now_ms: u64) -> Result<ResetHandle, LimiterError> {
        let decision = self
            .store
            .attempt(key, &self.backoff, now_ms)
            .await
            .map_err(|err| {
                error!(store = self.store.name(), "rate limiter store failed: {err:#}");
                LimiterError::Store(err)
            })?;

        match decision {
            Decision::Admitted { .. } => Ok(ResetHandle {
                store: Arc::clone(&self.store),
                key: key.to_string(),
            }),
            Decision::Throttled { retry_after_ms } => {
                warn!(retry_after_ms, "client throttled");
                Err(LimiterError::Throttled {
                    retry_after: Duration::from_millis(retry_after_ms),
                })
            }
        }
    }

    /// # Errors
    /// Returns a `StoreError` if the store cannot delete the record.
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.reset(key).await
    }
}
