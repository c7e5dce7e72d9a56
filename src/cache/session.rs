use std::time::Duration;

use super::{Cache, CacheOp};
use crate::error::CacheError;

/// Unit of work over the shared cache.
///
/// Reads go straight to the cache. Writes are buffered and become visible
/// together on [`CacheSession::commit`]; a session dropped without commit
/// discards them.
pub struct CacheSession<'a> {
    cache: &'a dyn Cache,
    pending: Vec<CacheOp>,
}

impl<'a> CacheSession<'a> {
    pub fn begin(cache: &'a dyn Cache) -> Self {
        Self {
            cache,
            pending: Vec::new(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.cache.get(key).await
    }

    pub async fn server_time(&self) -> Result<f64, CacheError> {
        self.cache.server_time().await
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        self.pending.push(CacheOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.pending.push(CacheOp::Delete { key: key.into() });
    }

    pub fn pending(&self) -> &[CacheOp] {
        &self.pending
    }

    pub async fn commit(self) -> Result<(), CacheError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.cache.apply(self.pending).await
    }

    pub fn rollback(self) {
        drop(self);
    }
}
