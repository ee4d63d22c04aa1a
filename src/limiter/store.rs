//! Attempt store contract.

use super::{Backoff, Decision};
use async_trait::async_trait;
use thiserror::Error;

/// Per-client counter as kept by a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Admitted attempts since the record was created.
    pub count: u64,
    /// First request that created the record, ms since the Unix epoch.
    pub first_ms: u64,
    /// Last admitted attempt, ms since the Unix epoch.
    pub last_ms: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store command failed")]
    Command(#[source] anyhow::Error),
    #[error("store returned an unexpected reply: {0}")]
    Reply(String),
}

/// Backing store for rate-limit records.
///
/// `attempt` is a single atomic read-modify-write: it evaluates the client's record
/// against `backoff`, records the attempt when admitted, and sets the record expiry.
/// Concurrent callers for the same key must never lose an update.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn attempt(&self, key: &str, backoff: &Backoff, now_ms: u64)
        -> Result<Decision, StoreError>;

    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}
