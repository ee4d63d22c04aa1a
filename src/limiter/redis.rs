//! Redis-backed attempt store shared by every instance of a deployment.
//!
//! Each attempt runs as one Lua script so the read, the backoff decision and the
//! write happen atomically on the server.

use super::{AttemptStore, Backoff, Decision, StoreError};
use crate::error::ConfigError;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::debug;
use url::Url;

const KEY_PREFIX: &str = "tokengate:attempts:";

// KEYS[1] record key
// ARGV[1] now (ms), ARGV[2] free retries, ARGV[3] lifetime (ms), ARGV[4] refresh (0|1)
// ARGV[5..] delay table (ms)
// Returns {1, attempts} when admitted, {0, retry_after_ms} when throttled.
const ATTEMPT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local free = tonumber(ARGV[2])
local lifetime = tonumber(ARGV[3])
local refresh = tonumber(ARGV[4])

local rec = redis.call('HMGET', KEYS[1], 'count', 'first', 'last')
local count = tonumber(rec[1]) or 0
local first = tonumber(rec[2]) or now
local last = tonumber(rec[3]) or now

if count > 0 and count >= free then
  local delay = tonumber(ARGV[count - free + 5]) or tonumber(ARGV[#ARGV])
  local next_allowed = last + delay
  if next_allowed > now then
    return {0, next_allowed - now}
  end
end

count = count + 1
redis.call('HSET', KEYS[1], 'count', count, 'first', first, 'last', now)
if refresh == 1 then
  redis.call('PEXPIRE', KEYS[1], lifetime)
else
  redis.call('PEXPIREAT', KEYS[1], first + lifetime)
end
return {1, count}
";

pub struct RedisStore {
    manager: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn record_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn store_url(host: &str, port: u16) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::InvalidStoreAddress(format!("{host}:{port}"));

    // IPv6 literals need brackets in a URL.
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.trim().to_string()
    };

    let mut url = Url::parse("redis://localhost/").map_err(|_| invalid())?;
    url.set_host(Some(&host)).map_err(|_| invalid())?;
    url.set_port(Some(port)).map_err(|()| invalid())?;
    Ok(url)
}

impl RedisStore {
    /// Connect to `host:port`.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the address is invalid or the server cannot be reached.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConfigError> {
        Self::open(store_url(host, port)?.as_str()).await
    }

    /// Connect with a full `redis://` URL.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the URL is invalid or the server cannot be reached.
    pub async fn open(url: &str) -> Result<Self, ConfigError> {
        let client =
            Client::open(url).map_err(|err| ConfigError::InvalidStoreAddress(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(ConfigError::StoreUnreachable)?;

        debug!("connected rate limiter store");

        Ok(Self {
            manager,
            script: Script::new(ATTEMPT_SCRIPT),
        })
    }
}

#[async_trait]
impl AttemptStore for RedisStore {
    async fn attempt(
        &self,
        key: &str,
        backoff: &Backoff,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        let mut conn = self.manager.clone();

        let mut invocation = self.script.key(record_key(key));
        invocation
            .arg(now_ms)
            .arg(backoff.free_retries())
            .arg(backoff.lifetime_ms())
            .arg(u8::from(backoff.refresh_on_request()));
        for delay in backoff.delays_ms() {
            invocation.arg(*delay);
        }

        let reply: Vec<u64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Command(err.into()))?;

        match reply.as_slice() {
            [1, attempts] => Ok(Decision::Admitted {
                attempts: *attempts,
            }),
            [0, retry_after_ms] => Ok(Decision::Throttled {
                retry_after_ms: *retry_after_ms,
            }),
            other => Err(StoreError::Reply(format!("{other:?}"))),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(record_key(key))
            .await
            .map_err(|err| StoreError::Command(err.into()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(record_key("10.0.0.1"), "tokengate:attempts:10.0.0.1");
    }

    #[test]
    fn builds_store_url() {
        let url = store_url("redis.internal", 6380).map(|u| u.to_string());
        assert_eq!(url.ok().as_deref(), Some("redis://redis.internal:6380/"));

        let url = store_url("::1", 6379).map(|u| u.to_string());
        assert_eq!(url.ok().as_deref(), Some("redis://[::1]:6379/"));

        assert!(matches!(
            store_url("bad host", 6379),
            Err(ConfigError::InvalidStoreAddress(_))
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        assert!(matches!(
            RedisStore::open("not a url").await,
            Err(ConfigError::InvalidStoreAddress(_))
        ));
    }

    // Runs against a live server only when TOKENGATE_TEST_REDIS_URL is set.
    #[tokio::test]
    async fn backoff_matches_memory_store() -> anyhow::Result<()> {
        let Ok(url) = std::env::var("TOKENGATE_TEST_REDIS_URL") else {
            eprintln!("Skipping redis store test: TOKENGATE_TEST_REDIS_URL is not set");
            return Ok(());
        };

        let store = RedisStore::open(&url).await?;
        let backoff = Backoff::new(
            3,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(60),
            false,
        );
        let key = format!("test-{}", ulid::Ulid::new());
        let now = crate::limiter::now_ms();

        store.reset(&key).await?;
        for attempt in 1..=3 {
            assert_eq!(
                store.attempt(&key, &backoff, now).await?,
                Decision::Admitted { attempts: attempt }
            );
        }
        assert_eq!(
            store.attempt(&key, &backoff, now + 500).await?,
            Decision::Throttled {
                retry_after_ms: 1_500
            }
        );
        assert_eq!(
            store.attempt(&key, &backoff, now + 10_000).await?,
            Decision::Admitted { attempts: 4 }
        );

        store.reset(&key).await?;
        assert_eq!(
            store.attempt(&key, &backoff, now + 10_001).await?,
            Decision::Admitted { attempts: 1 }
        );
        store.reset(&key).await?;
        Ok(())
    }
}
