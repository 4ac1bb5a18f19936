//! # Conveyor Cache
//!
//! Narrow cache-client contract used by the deduplication behavior: an
//! add-if-absent with TTL and a remove. Expired keys count as absent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{Clock, Result, SystemClock};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Cache client contract.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Insert `key` with the given TTL. Returns `true` iff the key was absent
    /// (or expired) and is now set.
    async fn add(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key`. Returns `true` iff the key was present.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory cache client with per-key expiry driven by the injected clock.
pub struct InMemoryCacheClient {
    entries: DashMap<String, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCacheClient {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| *e.value() > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCacheClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheClient for InMemoryCacheClient {
    async fn add(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        let mut inserted = false;
        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if *existing <= now {
                    *existing = expires_at;
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                expires_at
            });

        Ok(inserted)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        match self.entries.remove(key) {
            Some((_, expires_at)) => Ok(expires_at > now),
            None => Ok(false),
        }
    }
}

/// Cache client that never remembers anything; `add` always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCacheClient;

#[async_trait]
impl CacheClient for NullCacheClient {
    async fn add(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn remove(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}
