use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Cache, CacheOp, LockConfig, LockHandle};
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    locks: HashMap<String, Entry>,
}

impl State {
    /// Drop expired entries and lapsed locks. Most keys (revoked tokens, one-off
    /// clients) are never read again, so expiry cannot wait for a lookup.
    fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.is_live(now));
        self.locks.retain(|_, lock| lock.is_live(now));
    }
}

/// Single-process cache backend.
///
/// Suitable for one instance in debug runs and for tests; it offers the same
/// atomicity and lock semantics as the Redis backend within one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<State>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, excluding locks.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining time to live of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn server_time(&self) -> Result<f64, CacheError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(now.as_secs_f64())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn apply(&self, ops: Vec<CacheOp>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge(now);
        for op in ops {
            match op {
                CacheOp::Set { key, value, ttl } => {
                    let expires_at = ttl.map(|ttl| now + ttl);
                    state.entries.insert(key, Entry { value, expires_at });
                }
                CacheOp::Delete { key } => {
                    state.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, config: &LockConfig) -> Result<LockHandle, CacheError> {
        let token = Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + config.acquire_timeout;

        loop {
            {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                let free = state.locks.get(name).map_or(true, |held| !held.is_live(now));
                if free {
                    state.purge(now);
                    state.locks.insert(
                        name.to_string(),
                        Entry {
                            value: token.clone(),
                            expires_at: Some(now + config.lease),
                        },
                    );
                    return Ok(LockHandle {
                        name: name.to_string(),
                        token,
                    });
                }
            }

            if Instant::now() + config.retry_interval > deadline {
                return Err(CacheError::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(config.retry_interval).await;
        }
    }

    async fn release_lock(&self, handle: LockHandle) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.locks.get(&handle.name) {
            Some(held) if held.value == handle.token && held.is_live(now) => {
                state.locks.remove(&handle.name);
                Ok(())
            }
            _ => Err(CacheError::LockLost(handle.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .apply(vec![CacheOp::Set {
                key: "short".into(),
                value: "1".into(),
                ttl: Some(Duration::from_millis(20)),
            }])
            .await
            .unwrap();
        assert_eq!(cache.get("short").await.unwrap().as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_purge_expired_entries() {
        let cache = MemoryCache::new();
        let ops = (0..1000)
            .map(|i| CacheOp::Set {
                key: format!("rate_limiter:10.0.{}.{}", i / 256, i % 256),
                value: "1".into(),
                ttl: Some(Duration::from_millis(10)),
            })
            .collect();
        cache.apply(ops).await.unwrap();
        let config = LockConfig {
            lease: Duration::from_millis(10),
            ..LockConfig::default()
        };
        let lock = cache.acquire_lock("rate_limiter:10.0.0.1:lock", &config).await.unwrap();
        drop(lock);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache
            .apply(vec![CacheOp::Set { key: "fresh".into(), value: "1".into(), ttl: None }])
            .await
            .unwrap();

        let state = cache.state.lock().await;
        assert_eq!(state.entries.len(), 1);
        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn test_apply_is_ordered() {
        let cache = MemoryCache::new();
        cache
            .apply(vec![
                CacheOp::Set { key: "k".into(), value: "old".into(), ttl: None },
                CacheOp::Delete { key: "k".into() },
                CacheOp::Set { key: "k".into(), value: "new".into(), ttl: None },
            ])
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_lost() {
        let cache = MemoryCache::new();
        let config = LockConfig {
            lease: Duration::from_millis(20),
            acquire_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(5),
        };

        let first = cache.acquire_lock("l", &config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The lease ran out, so a second holder may take over
        let second = cache.acquire_lock("l", &config).await.unwrap();
        assert!(matches!(cache.release_lock(first).await, Err(CacheError::LockLost(_))));
        cache.release_lock(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_time_is_epoch_seconds() {
        let cache = MemoryCache::new();
        let t = cache.server_time().await.unwrap();
        assert!(t > 1_600_000_000.0);
    }
}
