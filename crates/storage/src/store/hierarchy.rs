#![forbid(unsafe_code)]

use super::support::*;
use super::{
    DescendantsRequest, MoveChunkRequest, SqliteStore, StoreError, canonical_id,
    canonical_optional_id,
};
use crate::cache::{CachedResult, cache_key, ops};
use chunkdb_core::chunk::{Chunk, HierarchyEntry};
use rusqlite::{Transaction, params};
use serde_json::json;
use tracing::debug;

/// Relinks the closure rows of `chunk_id`'s subtree and records every cache scope
/// the move touches. The `parent` column is left to the caller.
pub(super) fn reparent_tx(
    tx: &Transaction<'_>,
    ctx: &mut WriteCtx,
    chunk_id: &str,
    old_parent: Option<&str>,
    new_parent: Option<&str>,
) -> Result<(), StoreError> {
    let old_ancestors = strict_ancestor_ids_tx(tx, chunk_id)?;
    relink_subtree_tx(tx, chunk_id, new_parent, ctx.max_depth)?;
    let new_ancestors = strict_ancestor_ids_tx(tx, chunk_id)?;
    let subtree = subtree_ids_tx(tx, chunk_id)?;

    ctx.invalidation.children(old_parent);
    ctx.invalidation.children(new_parent);
    ctx.invalidation.descendants(&old_ancestors);
    ctx.invalidation.descendants(&new_ancestors);
    ctx.invalidation.ancestors(&subtree);
    Ok(())
}

pub(super) fn require_anchor_tx(
    tx: &Transaction<'_>,
    op: &'static str,
    chunk_id: &str,
) -> Result<(), StoreError> {
    if chunk_exists_tx(tx, chunk_id)? {
        Ok(())
    } else {
        Err(StoreError::not_found(op, "chunk", chunk_id))
    }
}

fn collect_ids(
    tx: &Transaction<'_>,
    sql: &str,
    values: impl rusqlite::Params,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare_cached(sql)?;
    let mut rows = stmt.query(values)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

/// Pairs each cached id with its closure row relative to `anchor_id`.
fn hydrate_entries_tx(
    tx: &Transaction<'_>,
    anchor_id: &str,
    ids: &[String],
    anchor_is_ancestor: bool,
) -> Result<Vec<HierarchyEntry>, StoreError> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let row = if anchor_is_ancestor {
            closure_row_tx(tx, anchor_id, id)?
        } else {
            closure_row_tx(tx, id, anchor_id)?
        };
        let (Some(row), Some(chunk)) = (row, load_chunk_tx(tx, id)?) else {
            continue;
        };
        out.push(HierarchyEntry {
            chunk,
            depth: row.depth,
            path: row.path,
        });
    }
    Ok(out)
}

impl SqliteStore {
    /// Direct children, oldest first.
    pub fn children(&self, parent_id: &str) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "children";
        let parent_id = canonical_id(OP, "parent_id", parent_id)?;
        let key = cache_key(ops::CHILDREN, &parent_id, &json!({}));

        let (chunks, hit) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                require_anchor_tx(tx, OP, &parent_id)?;
                let ids = collect_ids(
                    tx,
                    "SELECT h.descendant_id FROM chunk_hierarchy h \
                     JOIN chunks c ON c.chunk_id = h.descendant_id \
                     WHERE h.ancestor_id=?1 AND h.depth=1 \
                     ORDER BY c.created_at_ms ASC, c.chunk_id ASC",
                    params![parent_id],
                )?;
                Ok(CachedResult::new(ids))
            },
            |tx, cached| load_chunks_tx(tx, &cached.ids),
        )?;
        debug!(parent_id = %parent_id, count = chunks.len(), cache_hit = hit, "children");
        Ok(chunks)
    }

    /// Breadth-first: ascending depth, then creation time, then id.
    pub fn descendants(&self, request: DescendantsRequest) -> Result<Vec<HierarchyEntry>, StoreError> {
        const OP: &str = "descendants";
        let ancestor_id = canonical_id(OP, "ancestor_id", &request.ancestor_id)?;
        let key = cache_key(
            ops::DESCENDANTS,
            &ancestor_id,
            &json!({
                "max_depth": request.max_depth,
                "limit": request.limit,
                "offset": request.offset,
            }),
        );
        let max_depth = request
            .max_depth
            .map(|depth| to_sqlite_i64(OP, depth))
            .transpose()?;
        let limit = sql_limit(OP, request.limit)?;
        let offset = to_sqlite_i64(OP, request.offset)?;

        let (entries, hit) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                require_anchor_tx(tx, OP, &ancestor_id)?;
                let ids = collect_ids(
                    tx,
                    "SELECT h.descendant_id FROM chunk_hierarchy h \
                     JOIN chunks c ON c.chunk_id = h.descendant_id \
                     WHERE h.ancestor_id=?1 AND h.depth > 0 AND (?2 IS NULL OR h.depth <= ?2) \
                     ORDER BY h.depth ASC, c.created_at_ms ASC, c.chunk_id ASC \
                     LIMIT ?3 OFFSET ?4",
                    params![ancestor_id, max_depth, limit, offset],
                )?;
                Ok(CachedResult::new(ids))
            },
            |tx, cached| hydrate_entries_tx(tx, &ancestor_id, &cached.ids, true),
        )?;
        debug!(ancestor_id = %ancestor_id, count = entries.len(), cache_hit = hit, "descendants");
        Ok(entries)
    }

    /// Chain from the root down to the direct parent.
    pub fn ancestors(&self, chunk_id: &str) -> Result<Vec<HierarchyEntry>, StoreError> {
        const OP: &str = "ancestors";
        let chunk_id = canonical_id(OP, "chunk_id", chunk_id)?;
        let key = cache_key(ops::ANCESTORS, &chunk_id, &json!({}));

        let (entries, _) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                require_anchor_tx(tx, OP, &chunk_id)?;
                let ids = collect_ids(
                    tx,
                    "SELECT ancestor_id FROM chunk_hierarchy \
                     WHERE descendant_id=?1 AND depth > 0 ORDER BY depth DESC",
                    params![chunk_id],
                )?;
                Ok(CachedResult::new(ids))
            },
            |tx, cached| hydrate_entries_tx(tx, &chunk_id, &cached.ids, false),
        )?;
        Ok(entries)
    }

    /// Re-parents `chunk_id` (with its subtree); `new_parent_id = None` makes it a root.
    pub fn move_chunk(&mut self, request: MoveChunkRequest) -> Result<Chunk, StoreError> {
        const OP: &str = "move_chunk";
        let chunk_id = canonical_id(OP, "chunk_id", &request.chunk_id)?;
        let new_parent = canonical_optional_id(OP, "new_parent_id", request.new_parent_id.as_deref())?;

        let chunk = self.write_tx(OP, |tx, ctx| {
            let existing = require_chunk_tx(tx, OP, "chunk", &chunk_id)?;
            if let Some(expected) = request.expected_revision {
                if expected != existing.revision {
                    return Err(StoreError::RevisionMismatch {
                        chunk_id: chunk_id.clone(),
                        expected,
                        actual: existing.revision,
                    });
                }
            }
            if let Some(parent) = new_parent.as_deref() {
                if parent != chunk_id && !chunk_exists_tx(tx, parent)? {
                    return Err(StoreError::not_found(OP, "parent", parent));
                }
            }
            if existing.parent == new_parent {
                return Ok(existing);
            }

            reparent_tx(tx, ctx, &chunk_id, existing.parent.as_deref(), new_parent.as_deref())?;
            let now_ms = ctx.next_ts();
            set_parent_field_tx(tx, &chunk_id, new_parent.as_deref(), now_ms)?;
            require_chunk_tx(tx, OP, "chunk", &chunk_id)
        })?;
        debug!(chunk_id = %chunk.chunk_id, parent = ?chunk.parent, "chunk moved");
        Ok(chunk)
    }

    /// Number of chunks strictly below `chunk_id`.
    pub fn subtree_size(&self, chunk_id: &str) -> Result<usize, StoreError> {
        const OP: &str = "subtree_size";
        let chunk_id = canonical_id(OP, "chunk_id", chunk_id)?;
        self.read_tx(OP, |tx| {
            require_anchor_tx(tx, OP, &chunk_id)?;
            let count = tx.query_row(
                "SELECT COUNT(1) FROM chunk_hierarchy WHERE ancestor_id=?1 AND depth > 0",
                params![chunk_id],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}
