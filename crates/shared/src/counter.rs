//! Counter store: atomic increment with expiry
//!
//! Backs the fixed-window rate limiter. Redis is used in production; the
//! in-memory store serves development and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::CounterError;

/// Count and remaining lifetime of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
    pub ttl: Duration,
}

/// Atomic counter primitives
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`. A key that does not exist is created at 1 with `ttl`;
    /// an existing key keeps its expiry.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSnapshot, CounterError>;

    /// Current value without mutating it
    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError>;

    /// Drop expired keys. Redis expires keys itself.
    async fn cleanup(&self) -> usize {
        0
    }
}

// INCR and EXPIRE must land together or a crash between them leaves an immortal key.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Redis-backed counter store
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!("Redis counter store connected");
        Ok(Self {
            manager,
            script: redis::Script::new(INCR_WITH_TTL),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSnapshot, CounterError> {
        let mut conn = self.manager.clone();
        let (count, remaining): (i64, i64) = self
            .script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        if count < 0 {
            return Err(CounterError::Protocol(format!("negative counter {}", count)));
        }

        Ok(CounterSnapshot {
            count: count as u64,
            ttl: Duration::from_secs(remaining.max(0) as u64),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError> {
        let mut conn = self.manager.clone();
        let (count, remaining): (Option<u64>, i64) = redis::pipe()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await?;

        Ok(count.map(|count| CounterSnapshot {
            count,
            ttl: Duration::from_secs(remaining.max(0) as u64),
        }))
    }
}

/// In-memory counter store (for development without Redis)
pub struct InMemoryCounterStore {
    /// key -> (count, expires_at unix seconds)
    counters: RwLock<HashMap<String, (u64, i64)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<CounterSnapshot, CounterError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let mut counters = self.counters.write().await;
        let entry = counters.entry(key.to_string()).or_insert((0, now + ttl_secs));

        // Expired window starts over
        if entry.1 <= now {
            *entry = (0, now + ttl_secs);
        }
        entry.0 += 1;

        Ok(CounterSnapshot {
            count: entry.0,
            ttl: Duration::from_secs((entry.1 - now).max(0) as u64),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>, CounterError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let counters = self.counters.read().await;

        Ok(counters
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(count, expires_at)| CounterSnapshot {
                count: *count,
                ttl: Duration::from_secs((expires_at - now) as u64),
            }))
    }

    async fn cleanup(&self) -> usize {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, (_, expires_at)| *expires_at > now);
        before - counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_increment_sets_ttl() {
        let store = InMemoryCounterStore::new();
        let snap = store
            .incr_with_ttl("k", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(snap.count, 1);
        assert!(snap.ttl.as_secs() <= 60 && snap.ttl.as_secs() >= 59);
    }

    #[tokio::test]
    async fn test_increments_share_window() {
        let store = InMemoryCounterStore::new();
        for _ in 0..4 {
            store
                .incr_with_ttl("k", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let snap = store.get("k").await.unwrap().unwrap();
        assert_eq!(snap.count, 4);
        assert!(store.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(InMemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_with_ttl("shared", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("shared").await.unwrap().unwrap().count, 50);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_counter_store() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL required");
        let store = RedisCounterStore::connect(&url).await.unwrap();
        let key = format!("test:counter:{}", uuid::Uuid::new_v4());
        let first = store
            .incr_with_ttl(&key, Duration::from_secs(5))
            .await
            .unwrap();
        let second = store
            .incr_with_ttl(&key, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.ttl.as_secs() <= 5);
    }
}
