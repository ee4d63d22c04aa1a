//! In-process attempt store for single-instance deployments.

use super::{AttemptRecord, AttemptStore, Backoff, Decision, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

// Expired records are swept once the map grows past this many entries,
// at most once per PRUNE_INTERVAL_MS.
const PRUNE_THRESHOLD: usize = 4096;
const PRUNE_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug)]
struct Entry {
    record: AttemptRecord,
    expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_prune_ms: u64,
}

impl Entries {
    fn live(&self, key: &str, now_ms: u64) -> Option<AttemptRecord> {
        self.map
            .get(key)
            .filter(|entry| entry.expires_at_ms > now_ms)
            .map(|entry| entry.record)
    }

    // Returns whether a sweep ran.
    fn prune(&mut self, now_ms: u64) -> bool {
        if self.map.len() < PRUNE_THRESHOLD || now_ms < self.next_prune_ms {
            return false;
        }
        self.map.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.next_prune_ms = now_ms.saturating_add(PRUNE_INTERVAL_MS);
        true
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live record for `key`, if any.
    pub async fn record(&self, key: &str, now_ms: u64) -> Option<AttemptRecord> {
        self.entries.lock().await.live(key, now_ms)
    }

    /// Stored records, expired ones included until the next sweep.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.map.is_empty()
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn attempt(
        &self,
        key: &str,
        backoff: &Backoff,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let mut entries = self.entries.lock().await;

        entries.prune(now_ms);
        let live = entries.live(key, now_ms);

        let decision = backoff.evaluate(live.as_ref(), now_ms);
        if let Decision::Admitted { .. } = decision {
            let record = backoff.advance(live, now_ms);
            let expires_at_ms = backoff.expires_at_ms(&record);
            entries.map.insert(
                key.to_string(),
                Entry {
                    record,
                    expires_at_ms,
                },
            );
        }

        Ok(decision)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.map.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
