#![forbid(unsafe_code)]

use super::hierarchy::require_anchor_tx;
use super::support::*;
use super::{
    ChangeTagsRequest, ChunksByTagRequest, ChunksByTagsRequest, SqliteStore, StoreError,
    canonical_id,
};
use crate::cache::{CachedResult, cache_key, ops};
use chunkdb_core::chunk::{Chunk, TagMatch, TagStatistic, normalize_tag_ids, sorted_tag_set};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Transaction, params, params_from_iter};
use serde_json::json;
use tracing::debug;

fn canonical_tag_list(op: &'static str, tag_ids: &[String]) -> Result<Vec<String>, StoreError> {
    normalize_tag_ids(tag_ids)
        .map_err(|err| StoreError::validation(op, None, format!("tag_ids: {}", err.message())))
}

/// Ids of chunks carrying the tags in `tag_ids` (already sorted and de-duplicated),
/// newest first.
fn tagged_source_ids_tx(
    tx: &Transaction<'_>,
    tag_ids: &[String],
    mode: TagMatch,
    limit: i64,
    offset: i64,
) -> Result<Vec<String>, StoreError> {
    if tag_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; tag_ids.len()].join(", ");
    let having = match mode {
        TagMatch::And => "HAVING COUNT(DISTINCT ct.tag_chunk_id) = ?",
        TagMatch::Or => "",
    };
    let sql = format!(
        "SELECT c.chunk_id FROM chunk_tags ct \
         JOIN chunks c ON c.chunk_id = ct.source_chunk_id \
         WHERE ct.tag_chunk_id IN ({placeholders}) \
         GROUP BY c.chunk_id {having} \
         ORDER BY c.created_at_ms DESC, c.chunk_id ASC \
         LIMIT ? OFFSET ?"
    );

    let mut values: Vec<SqlValue> = tag_ids.iter().cloned().map(SqlValue::Text).collect();
    if mode == TagMatch::And {
        values.push(SqlValue::Integer(tag_ids.len() as i64));
    }
    values.push(SqlValue::Integer(limit));
    values.push(SqlValue::Integer(offset));

    let mut stmt = tx.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

impl SqliteStore {
    /// Appends tags (in order, skipping ones already present) to the chunk's field
    /// and relation rows.
    pub fn add_tags(&mut self, request: ChangeTagsRequest) -> Result<Chunk, StoreError> {
        const OP: &str = "add_tags";
        let chunk_id = canonical_id(OP, "chunk_id", &request.chunk_id)?;
        let tag_ids = canonical_tag_list(OP, &request.tag_ids)?;

        let chunk = self.write_tx(OP, |tx, ctx| {
            let existing = require_chunk_tx(tx, OP, "chunk", &chunk_id)?;
            validate_tag_targets_tx(tx, OP, &chunk_id, &tag_ids)?;

            let mut field = existing.tags.clone();
            for tag_id in &tag_ids {
                if !field.contains(tag_id) {
                    field.push(tag_id.clone());
                }
            }
            let now_ms = ctx.next_ts();
            let inserted = insert_tag_relations_tx(tx, &chunk_id, &tag_ids, now_ms)?;
            if field == existing.tags && inserted == 0 {
                return Ok(existing);
            }
            set_tags_field_tx(tx, &chunk_id, &field, now_ms)?;

            ctx.invalidation.tags(&tag_ids);
            ctx.invalidation.chunk_tags(&chunk_id);
            require_chunk_tx(tx, OP, "chunk", &chunk_id)
        })?;
        debug!(chunk_id = %chunk.chunk_id, tags = ?chunk.tags, "tags added");
        Ok(chunk)
    }

    pub fn remove_tags(&mut self, request: ChangeTagsRequest) -> Result<Chunk, StoreError> {
        const OP: &str = "remove_tags";
        let chunk_id = canonical_id(OP, "chunk_id", &request.chunk_id)?;
        let tag_ids = canonical_tag_list(OP, &request.tag_ids)?;

        let chunk = self.write_tx(OP, |tx, ctx| {
            let existing = require_chunk_tx(tx, OP, "chunk", &chunk_id)?;
            let field: Vec<String> = existing
                .tags
                .iter()
                .filter(|tag| !tag_ids.contains(tag))
                .cloned()
                .collect();
            let deleted = delete_tag_relations_tx(tx, &chunk_id, &tag_ids)?;
            if field == existing.tags && deleted == 0 {
                return Ok(existing);
            }
            let now_ms = ctx.next_ts();
            set_tags_field_tx(tx, &chunk_id, &field, now_ms)?;

            ctx.invalidation.tags(&tag_ids);
            ctx.invalidation.chunk_tags(&chunk_id);
            require_chunk_tx(tx, OP, "chunk", &chunk_id)
        })?;
        debug!(chunk_id = %chunk.chunk_id, tags = ?chunk.tags, "tags removed");
        Ok(chunk)
    }

    /// Chunks tagged with `tag_id`, newest first, ties by id.
    pub fn chunks_by_tag(&self, request: ChunksByTagRequest) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "chunks_by_tag";
        let tag_id = canonical_id(OP, "tag_id", &request.tag_id)?;
        let key = cache_key(
            ops::BY_TAG,
            &tag_id,
            &json!({"limit": request.limit, "offset": request.offset}),
        );
        let limit = sql_limit(OP, request.limit)?;
        let offset = to_sqlite_i64(OP, request.offset)?;
        let tag_ids = vec![tag_id.clone()];

        let (chunks, hit) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                tagged_source_ids_tx(tx, &tag_ids, TagMatch::Or, limit, offset)
                    .map(CachedResult::new)
            },
            |tx, cached| load_chunks_tx(tx, &cached.ids),
        )?;
        debug!(tag_id = %tag_id, count = chunks.len(), cache_hit = hit, "chunks by tag");
        Ok(chunks)
    }

    /// `And` keeps chunks carrying every tag; `Or` the distinct union. An empty
    /// tag list matches nothing.
    pub fn chunks_by_tags(&self, request: ChunksByTagsRequest) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "chunks_by_tags";
        let tag_ids = sorted_tag_set(&canonical_tag_list(OP, &request.tag_ids)?);
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }
        let key = cache_key(
            ops::BY_TAGS,
            "",
            &json!({
                "tags": tag_ids,
                "mode": request.mode.as_str(),
                "limit": request.limit,
                "offset": request.offset,
            }),
        );
        let limit = sql_limit(OP, request.limit)?;
        let offset = to_sqlite_i64(OP, request.offset)?;

        let (chunks, hit) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                tagged_source_ids_tx(tx, &tag_ids, request.mode, limit, offset)
                    .map(CachedResult::new)
            },
            |tx, cached| load_chunks_tx(tx, &cached.ids),
        )?;
        debug!(
            tags = tag_ids.len(),
            mode = request.mode.as_str(),
            count = chunks.len(),
            cache_hit = hit,
            "chunks by tags"
        );
        Ok(chunks)
    }

    /// Tag chunks of `chunk_id` according to the relation index, ordered by contents.
    pub fn chunk_tags(&self, chunk_id: &str) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "chunk_tags";
        let chunk_id = canonical_id(OP, "chunk_id", chunk_id)?;
        let key = cache_key(ops::CHUNK_TAGS, &chunk_id, &json!({}));

        let (chunks, _) = self.cached_read(
            OP,
            &key,
            None,
            |tx| {
                require_anchor_tx(tx, OP, &chunk_id)?;
                let mut stmt = tx.prepare_cached(
                    "SELECT t.chunk_id FROM chunk_tags ct \
                     JOIN chunks t ON t.chunk_id = ct.tag_chunk_id \
                     WHERE ct.source_chunk_id=?1 \
                     ORDER BY t.contents ASC, t.chunk_id ASC",
                )?;
                let mut rows = stmt.query(params![chunk_id])?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next()? {
                    ids.push(row.get::<_, String>(0)?);
                }
                Ok(CachedResult::new(ids))
            },
            |tx, cached| load_chunks_tx(tx, &cached.ids),
        )?;
        Ok(chunks)
    }

    /// Usage per tag chunk, most used first. Unused tag chunks report zero.
    pub fn tag_statistics(&self, limit: Option<usize>) -> Result<Vec<TagStatistic>, StoreError> {
        const OP: &str = "tag_statistics";
        let limit = sql_limit(OP, limit)?;
        self.read_tx(OP, |tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT t.chunk_id, t.contents, COUNT(ct.source_chunk_id), \
                        COALESCE(MAX(ct.created_at_ms), 0) \
                 FROM chunks t \
                 LEFT JOIN chunk_tags ct ON ct.tag_chunk_id = t.chunk_id \
                 WHERE t.is_tag = 1 \
                 GROUP BY t.chunk_id \
                 ORDER BY COUNT(ct.source_chunk_id) DESC, t.contents ASC, t.chunk_id ASC \
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(TagStatistic {
                    tag_chunk_id: row.get(0)?,
                    tag_contents: row.get(1)?,
                    usage_count: row.get(2)?,
                    last_used_ms: row.get(3)?,
                });
            }
            Ok(out)
        })
    }
}
