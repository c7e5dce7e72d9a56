use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{with_lock, Cache, CacheSession, LockConfig};
use crate::error::{AppError, AuthError, CacheError};

const LEDGER_NAMESPACE: &str = "rate_limiter";

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    /// Requests admitted back to back before spacing kicks in.
    pub burst: u32,
    /// A disabled limiter admits everything without touching the cache.
    pub enabled: bool,
    pub lock: LockConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 1,
            enabled: true,
            lock: LockConfig::default(),
        }
    }
}

/// Per-client request limiter using virtual scheduling (GCRA).
///
/// Each client key owns one number in the cache: the theoretical arrival time
/// `tat` of its next request. A request arriving at `now` is admitted when
/// `tat - now <= separation * (burst - 1)` and then pushes `tat` to
/// `max(tat, now) + separation`. Time comes from the cache server so every
/// instance of the service agrees on it.
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, cache: Arc<dyn Cache>) -> Self {
        Self { cache, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn separation(&self) -> f64 {
        1.0 / self.config.requests_per_second
    }

    /// Admit or reject one request from `client`.
    pub async fn check(&self, client: &str) -> Result<(), AppError> {
        if !self.config.enabled {
            return Ok(());
        }

        let key = format!("{}:{}", LEDGER_NAMESPACE, client);
        let lock = format!("{}:lock", key);
        let admitted = with_lock(self.cache.as_ref(), &lock, &self.config.lock, self.admit(&key)).await?;

        if admitted {
            Ok(())
        } else {
            warn!(client = client, "rate limit exceeded");
            Err(AuthError::TooManyRequests.into())
        }
    }

    async fn admit(&self, key: &str) -> Result<bool, AppError> {
        let mut session = CacheSession::begin(self.cache.as_ref());
        let now = session.server_time().await?;
        let tat = match session.get(key).await? {
            Some(raw) => raw.parse::<f64>().map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => now,
        };

        let separation = self.separation();
        let tolerance = separation * f64::from(self.config.burst.saturating_sub(1));
        if tat - now > tolerance {
            return Ok(false);
        }

        let next = tat.max(now) + separation;
        // The entry is meaningless once `now` passes it, so let it lapse.
        let ttl = Duration::from_secs_f64(next - now) + Duration::from_secs(1);
        session.set(key, next.to_string(), Some(ttl));
        session.commit().await?;

        debug!(key = key, tat = next, "request admitted");
        Ok(true)
    }
}
