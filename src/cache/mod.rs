//! Shared cache abstraction.
//!
//! The cache backs token revocation, refresh-token rotation, email
//! verification codes and the rate limiter ledger. Every instance of the
//! service talks to the same logical cache, so its clock and its locks are the
//! only ones that are safe to coordinate on.

mod memory;
mod redis_cache;
mod session;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{AppError, CacheError};

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;
pub use session::CacheSession;

/// A buffered cache mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

/// Proof of lock ownership returned by [`Cache::acquire_lock`].
#[derive(Debug)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Lock auto-expiry, so a crashed holder cannot wedge the key forever.
    pub lease: Duration,
    /// Upper bound on waiting for the lock.
    pub acquire_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(10),
        }
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Current time on the cache server, in seconds since the epoch.
    async fn server_time(&self) -> Result<f64, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Apply all operations atomically, in order.
    async fn apply(&self, ops: Vec<CacheOp>) -> Result<(), CacheError>;

    /// Acquire the named lock, waiting at most `config.acquire_timeout`.
    async fn acquire_lock(&self, name: &str, config: &LockConfig) -> Result<LockHandle, CacheError>;

    async fn release_lock(&self, handle: LockHandle) -> Result<(), CacheError>;
}

/// Run `operation` while holding the named lock.
///
/// The operation must finish within the lease: once the lease lapses another
/// holder may take the lock, so an operation still running at that point is
/// dropped and fails with [`CacheError::LockLost`]. Writes are committed at the
/// end of each locked operation, so a dropped one leaves nothing behind.
///
/// The lock is released on every exit path. A release failure after an
/// operation that finished within its lease is only logged: the operation ran
/// exclusively and its result must reach the caller.
pub async fn with_lock<T, F>(
    cache: &dyn Cache,
    name: &str,
    config: &LockConfig,
    operation: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    let handle = cache.acquire_lock(name, config).await?;
    let result = match tokio::time::timeout(config.lease, operation).await {
        Ok(result) => result,
        Err(_) => {
            warn!(lock = name, lease_ms = config.lease.as_millis() as u64, "locked operation outlived its lease");
            Err(CacheError::LockLost(name.to_string()).into())
        }
    };

    if let Err(release_err) = cache.release_lock(handle).await {
        warn!(lock = name, error = %release_err, "failed to release lock");
    }
    result
}

/// Seconds to pass as an expiry, rounded up so entries never vanish early.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
