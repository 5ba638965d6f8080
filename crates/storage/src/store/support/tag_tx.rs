#![forbid(unsafe_code)]

use super::super::StoreError;
use super::chunk_tx::{is_tag_chunk_tx, load_chunk_tx, set_tags_field_tx};
use chunkdb_core::chunk::TagDelta;
use rusqlite::{Transaction, params};

pub(in crate::store) fn validate_tag_targets_tx(
    tx: &Transaction<'_>,
    op: &'static str,
    source_id: &str,
    tag_ids: &[String],
) -> Result<(), StoreError> {
    for tag_id in tag_ids {
        if tag_id == source_id {
            return Err(StoreError::validation(
                op,
                Some(source_id),
                "a chunk cannot tag itself",
            ));
        }
        match is_tag_chunk_tx(tx, tag_id)? {
            None => return Err(StoreError::not_found(op, "tag", tag_id)),
            Some(false) => {
                return Err(StoreError::validation(
                    op,
                    Some(source_id),
                    format!("tag target {tag_id} is not a tag chunk"),
                ));
            }
            Some(true) => {}
        }
    }
    Ok(())
}

/// Tag ids recorded in the relation table for `source_id`, oldest relation first.
pub(in crate::store) fn relation_tag_ids_tx(
    tx: &Transaction<'_>,
    source_id: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT tag_chunk_id FROM chunk_tags WHERE source_chunk_id=?1 \
         ORDER BY created_at_ms ASC, tag_chunk_id ASC",
    )?;
    let mut rows = stmt.query(params![source_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

pub(in crate::store) fn tag_source_ids_tx(
    tx: &Transaction<'_>,
    tag_id: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT source_chunk_id FROM chunk_tags WHERE tag_chunk_id=?1 ORDER BY source_chunk_id",
    )?;
    let mut rows = stmt.query(params![tag_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

/// Returns how many relations were actually created.
pub(in crate::store) fn insert_tag_relations_tx(
    tx: &Transaction<'_>,
    source_id: &str,
    tag_ids: &[String],
    now_ms: i64,
) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO chunk_tags(source_chunk_id, tag_chunk_id, created_at_ms) \
         VALUES (?1, ?2, ?3)",
    )?;
    let mut inserted = 0;
    for tag_id in tag_ids {
        inserted += stmt.execute(params![source_id, tag_id, now_ms])?;
    }
    Ok(inserted)
}

pub(in crate::store) fn delete_tag_relations_tx(
    tx: &Transaction<'_>,
    source_id: &str,
    tag_ids: &[String],
) -> Result<usize, StoreError> {
    let mut stmt = tx
        .prepare_cached("DELETE FROM chunk_tags WHERE source_chunk_id=?1 AND tag_chunk_id=?2")?;
    let mut deleted = 0;
    for tag_id in tag_ids {
        deleted += stmt.execute(params![source_id, tag_id])?;
    }
    Ok(deleted)
}

/// Brings the relation rows of `source_id` in line with `tags`; untouched pairs keep
/// their original `created_at_ms`.
pub(in crate::store) fn sync_tag_relations_tx(
    tx: &Transaction<'_>,
    source_id: &str,
    tags: &[String],
    now_ms: i64,
) -> Result<TagDelta, StoreError> {
    let existing = relation_tag_ids_tx(tx, source_id)?;
    let delta = TagDelta::between(&existing, tags);
    insert_tag_relations_tx(tx, source_id, &delta.added, now_ms)?;
    delete_tag_relations_tx(tx, source_id, &delta.removed)?;
    Ok(delta)
}

/// Drops every relation sourced at `source_id`, returning the tag ids it pointed to.
pub(in crate::store) fn clear_tag_relations_tx(
    tx: &Transaction<'_>,
    source_id: &str,
) -> Result<Vec<String>, StoreError> {
    let removed = relation_tag_ids_tx(tx, source_id)?;
    tx.execute(
        "DELETE FROM chunk_tags WHERE source_chunk_id=?1",
        params![source_id],
    )?;
    Ok(removed)
}

/// Detaches a tag from every chunk that references it, either through a relation row
/// or through its `tags` field. Returns the chunks that were rewritten.
pub(in crate::store) fn detach_tag_everywhere_tx(
    tx: &Transaction<'_>,
    tag_id: &str,
    now_ms: i64,
) -> Result<Vec<String>, StoreError> {
    let mut affected = Vec::new();
    {
        let mut stmt = tx.prepare_cached(
            "SELECT source_chunk_id FROM chunk_tags WHERE tag_chunk_id=?1 \
             UNION \
             SELECT c.chunk_id FROM chunks c, json_each(c.tags_json) j WHERE j.value=?1 \
             ORDER BY 1",
        )?;
        let mut rows = stmt.query(params![tag_id])?;
        while let Some(row) = rows.next()? {
            affected.push(row.get::<_, String>(0)?);
        }
    }

    tx.execute(
        "DELETE FROM chunk_tags WHERE tag_chunk_id=?1",
        params![tag_id],
    )?;

    for source_id in &affected {
        let Some(chunk) = load_chunk_tx(tx, source_id)? else {
            continue;
        };
        if !chunk.tags.iter().any(|tag| tag == tag_id) {
            continue;
        }
        let remaining: Vec<String> = chunk
            .tags
            .into_iter()
            .filter(|tag| tag != tag_id)
            .collect();
        set_tags_field_tx(tx, source_id, &remaining, now_ms)?;
    }

    Ok(affected)
}
