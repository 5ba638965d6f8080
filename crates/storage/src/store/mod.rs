#![forbid(unsafe_code)]

mod audit;
mod chunks;
mod consistency;
mod error;
mod hierarchy;
mod requests;
mod search;
mod support;
mod tags;

pub use audit::AuditHandle;
pub use chunks::DeleteOutcome;
pub use consistency::{
    ConsistencyReport, Finding, HierarchyIssue, MismatchType, OrphanedTagRelation, Severity,
    TagConsistencyReport, TagMismatch, TagRepair, TagRepairSummary,
};
pub use error::StoreError;
pub use requests::*;

use crate::cache::{CachedResult, QueryCache};
use crate::config::StoreConfig;
use chunkdb_core::chunk::ChunkId;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use support::{WriteCtx, install_schema, preflight_gate};
use tracing::{debug, warn};

const DB_FILE_NAME: &str = "chunkdb.db";

/// Live caches by canonical database path, so every handle opened in this process
/// on one directory sees the same invalidations.
static SHARED_CACHES: Mutex<BTreeMap<PathBuf, Weak<QueryCache>>> =
    parking_lot::const_mutex(BTreeMap::new());

/// Returns the cache already serving `db_path`, or registers a new one. The first
/// opener's cache settings win while any handle keeps the cache alive.
fn shared_cache_for(db_path: PathBuf, config: &StoreConfig) -> Arc<QueryCache> {
    let mut caches = SHARED_CACHES.lock();
    caches.retain(|_, cache| cache.strong_count() > 0);
    if let Some(cache) = caches.get(&db_path).and_then(Weak::upgrade) {
        return cache;
    }
    let cache = Arc::new(QueryCache::new(config.cache.clone()));
    caches.insert(db_path, Arc::downgrade(&cache));
    cache
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    config: StoreConfig,
    cache: Arc<QueryCache>,
    last_ts_ms: i64,
}

impl SqliteStore {
    /// Opens a handle on `storage_dir`. Handles opened this way on the same directory
    /// share one query cache.
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(storage_dir, StoreConfig::default())
    }

    pub fn open_with_config(
        storage_dir: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref();
        std::fs::create_dir_all(storage_dir)?;
        let db_path = std::fs::canonicalize(storage_dir)?.join(DB_FILE_NAME);
        let cache = shared_cache_for(db_path, &config);
        Self::open_shared(storage_dir, config, cache)
    }

    /// Opens another handle that shares `cache` with existing handles on the same directory.
    pub fn open_shared(
        storage_dir: impl AsRef<Path>,
        config: StoreConfig,
        cache: Arc<QueryCache>,
    ) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;

        preflight_gate(&conn)?;
        install_schema(&conn)?;
        debug!(path = %db_path.display(), "chunk store opened");

        Ok(Self {
            conn,
            storage_dir,
            config,
            cache,
            last_ts_ms: 0,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(DB_FILE_NAME)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Runs `body` inside `BEGIN IMMEDIATE`, retrying transient lock contention.
    /// Cache invalidations collected by `body` are applied only after commit.
    fn write_tx<T>(
        &mut self,
        op: &'static str,
        mut body: impl FnMut(&Transaction<'_>, &mut WriteCtx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let policy = self.config.retry.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut ctx = WriteCtx::new(self.last_ts_ms, self.config.max_hierarchy_depth);
            match attempt_write(&mut self.conn, &mut ctx, &mut body) {
                Ok(value) => {
                    self.last_ts_ms = ctx.last_ts_ms();
                    ctx.invalidation.apply(&self.cache);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "database busy, retrying write"
                    );
                    std::thread::sleep(delay);
                }
                Err(err) if err.is_retryable() => {
                    warn!(op, attempts = attempt, "database busy, giving up");
                    return Err(into_transaction_error(err, op, attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `body` inside a deferred read transaction so it sees one snapshot.
    fn read_tx<T>(
        &self,
        op: &'static str,
        mut body: impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let policy = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match attempt_read(&self.conn, &mut body) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(op, attempt, "database busy, retrying read");
                    std::thread::sleep(delay);
                }
                Err(err) if err.is_retryable() => {
                    return Err(into_transaction_error(err, op, attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Serves `key` from the cache or computes it with `load`; either way the ids are
    /// turned into results by `hydrate` inside the same read snapshot.
    fn cached_read<T>(
        &self,
        op: &'static str,
        key: &str,
        ttl: Option<Duration>,
        mut load: impl FnMut(&Transaction<'_>) -> Result<CachedResult, StoreError>,
        mut hydrate: impl FnMut(&Transaction<'_>, &CachedResult) -> Result<T, StoreError>,
    ) -> Result<(T, bool), StoreError> {
        let (value, fill) = self.read_tx(op, |tx| {
            // Captured before the first statement so the snapshot is never older than the epoch.
            let epoch = self.cache.epoch();
            match self.cache.get(key) {
                Some(hit) => Ok((hydrate(tx, &hit)?, None)),
                None => {
                    let fresh = load(tx)?;
                    let value = hydrate(tx, &fresh)?;
                    Ok((value, Some((fresh, epoch))))
                }
            }
        })?;

        let hit = fill.is_none() && self.cache.is_enabled();
        if let Some((fresh, epoch)) = fill {
            self.cache.set_if_current(key, fresh, ttl, epoch);
        }
        Ok((value, hit))
    }
}

fn attempt_write<T>(
    conn: &mut Connection,
    ctx: &mut WriteCtx,
    body: &mut impl FnMut(&Transaction<'_>, &mut WriteCtx) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = body(&tx, ctx)?;
    tx.commit()?;
    Ok(value)
}

fn attempt_read<T>(
    conn: &Connection,
    body: &mut impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn into_transaction_error(err: StoreError, op: &'static str, attempts: u32) -> StoreError {
    match err {
        StoreError::Sql(source) => StoreError::Transaction {
            op,
            attempts,
            source,
        },
        StoreError::Batch { index, source } => StoreError::Batch {
            index,
            source: Box::new(into_transaction_error(*source, op, attempts)),
        },
        other => other,
    }
}

fn canonical_id(op: &'static str, field: &str, value: &str) -> Result<String, StoreError> {
    ChunkId::try_new(value)
        .map(ChunkId::into_string)
        .map_err(|err| StoreError::validation(op, None, format!("{field}: {}", err.message())))
}

fn canonical_optional_id(
    op: &'static str,
    field: &str,
    value: Option<&str>,
) -> Result<Option<String>, StoreError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => canonical_id(op, field, value).map(Some),
    }
}
