#![forbid(unsafe_code)]

//! In-memory TTL + LRU cache of query results.
//!
//! Entries hold chunk ids only; readers re-hydrate rows from the store, so a
//! cached id list never serves stale chunk contents.

mod key;

pub use key::{cache_key, op_prefix, ops, params_digest, scope_prefix, SCOPE_TERMINATOR};

use crate::config::CacheConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Longest lifetime an entry can get, whatever TTL was asked for.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedResult {
    pub ids: Vec<String>,
    /// Total rows matching the query, which may exceed `ids.len()` when paginated.
    pub total_count: usize,
}

impl CachedResult {
    pub fn new(ids: Vec<String>) -> Self {
        let total_count = ids.len();
        Self { ids, total_count }
    }

    pub fn with_total(ids: Vec<String>, total_count: usize) -> Self {
        Self { ids, total_count }
    }

    fn approx_bytes(&self) -> usize {
        self.ids.iter().map(|id| id.len() + 24).sum::<usize>() + 8
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug)]
struct Entry {
    value: CachedResult,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
    access_tick: u64,
    bytes: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: BTreeMap<String, Entry>,
    lru: BTreeMap<u64, String>,
    tick: u64,
    bytes: usize,
    epoch: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_tick);
        self.bytes = self.bytes.saturating_sub(entry.bytes);
        Some(entry)
    }

    fn evict_until_within(&mut self, max_entries: usize, max_bytes: usize) {
        while self.entries.len() > max_entries || self.bytes > max_bytes {
            let Some((_, key)) = self.lru.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes = self.bytes.saturating_sub(entry.bytes);
                self.stats.evictions += 1;
            }
        }
    }
}

/// Shared through `Arc` by every store handle that should see the same cache.
#[derive(Debug)]
pub struct QueryCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn get(&self, key: &str) -> Option<CachedResult> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                debug!(key, "cache miss");
                return None;
            }
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!(key, "cache entry expired");
            return None;
        }

        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.access_tick, tick);
        entry.hit_count += 1;
        let value = entry.value.clone();
        let age_ms = entry.created_at.elapsed().as_millis() as u64;
        inner.lru.remove(&old_tick);
        inner.lru.insert(tick, key.to_string());
        inner.stats.hits += 1;
        debug!(key, age_ms, "cache hit");
        Some(value)
    }

    /// Inserts unconditionally; `ttl = None` uses the configured default.
    pub fn set(&self, key: impl Into<String>, value: CachedResult, ttl: Option<Duration>) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key.into(), value, ttl);
    }

    /// Inserts only when no invalidation happened since `epoch` was read.
    pub fn set_if_current(
        &self,
        key: impl Into<String>,
        value: CachedResult,
        ttl: Option<Duration>,
        epoch: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            debug!(
                expected = epoch,
                current = inner.epoch,
                "skipping cache fill after concurrent invalidation"
            );
            return false;
        }
        self.insert_locked(&mut inner, key.into(), value, ttl)
    }

    fn insert_locked(
        &self,
        inner: &mut CacheInner,
        key: String,
        value: CachedResult,
        ttl: Option<Duration>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let bytes = key.len() + value.approx_bytes() + ENTRY_OVERHEAD_BYTES;
        if bytes > self.config.max_bytes {
            return false;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl).min(MAX_TTL);
        let created_at = Instant::now();
        let Some(expires_at) = created_at.checked_add(ttl) else {
            return false;
        };

        inner.remove(&key);
        let tick = inner.next_tick();
        inner.lru.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                created_at,
                expires_at,
                hit_count: 0,
                access_tick: tick,
                bytes,
            },
        );
        inner.bytes += bytes;
        inner.evict_until_within(self.config.max_entries, self.config.max_bytes);
        true
    }

    pub fn invalidate_exact(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let removed = inner.remove(key).is_some();
        if removed {
            inner.stats.invalidations += 1;
        }
        removed
    }

    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        inner.stats.invalidations += keys.len() as u64;
        if !keys.is_empty() {
            debug!(prefix, removed = keys.len(), "cache invalidated by prefix");
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.stats.invalidations += inner.entries.len() as u64;
        inner.entries.clear();
        inner.lru.clear();
        inner.bytes = 0;
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        inner.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Hit count of a live entry, mostly useful for diagnostics.
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|entry| entry.hit_count)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            ..inner.stats
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
