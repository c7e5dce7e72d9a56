use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ttl_seconds, Cache, CacheOp, LockConfig, LockHandle};
use crate::error::CacheError;

// Delete the lock only if we still own it.
const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed shared cache.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis cache");
        Ok(Self { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn server_time(&self) -> Result<f64, CacheError> {
        let mut conn = self.manager.clone();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs as f64 + micros as f64 / 1_000_000.0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn apply(&self, ops: Vec<CacheOp>) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                CacheOp::Set { key, value, ttl: Some(ttl) } => {
                    pipe.set_ex(key, value, ttl_seconds(*ttl)).ignore();
                }
                CacheOp::Set { key, value, ttl: None } => {
                    pipe.set(key, value).ignore();
                }
                CacheOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }

        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(ops = ops.len(), "applied cache batch");
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, config: &LockConfig) -> Result<LockHandle, CacheError> {
        let token = Uuid::new_v4().simple().to_string();
        let lease_ms = config.lease.as_millis().max(1) as u64;
        let deadline = Instant::now() + config.acquire_timeout;
        let mut conn = self.manager.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                return Ok(LockHandle {
                    name: name.to_string(),
                    token,
                });
            }

            if Instant::now() + config.retry_interval > deadline {
                return Err(CacheError::LockTimeout(name.to_string()));
            }
            tokio::time::sleep(config.retry_interval).await;
        }
    }

    async fn release_lock(&self, handle: LockHandle) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = Script::new(RELEASE_LOCK)
            .key(&handle.name)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(CacheError::LockLost(handle.name))
        }
    }
}
