#![forbid(unsafe_code)]

use super::super::StoreError;
use super::is_constraint_violation;
use chunkdb_core::chunk::{Chunk, ChunkFlags};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde_json::{Map, Value};

pub(in crate::store) const CHUNK_COLUMNS: &str = "c.chunk_id, c.contents, c.parent_id, c.page_id, \
     c.is_page, c.is_tag, c.is_template, c.is_slot, c.ref, c.tags_json, c.metadata_json, \
     c.revision, c.created_at_ms, c.updated_at_ms";

pub(in crate::store) fn chunk_from_row(row: &Row<'_>) -> Result<Chunk, StoreError> {
    let chunk_id: String = row.get(0)?;
    let tags_json: String = row.get(9)?;
    let metadata_json: String = row.get(10)?;

    let Ok(tags) = serde_json::from_str::<Vec<String>>(&tags_json) else {
        return Err(StoreError::Consistency {
            chunk_id,
            mismatch_type: "corrupt_tags_field",
        });
    };
    let metadata = match serde_json::from_str::<Value>(&metadata_json) {
        Ok(Value::Object(map)) => map,
        _ => {
            return Err(StoreError::Consistency {
                chunk_id,
                mismatch_type: "corrupt_metadata",
            });
        }
    };

    Ok(Chunk {
        chunk_id,
        contents: row.get(1)?,
        parent: row.get(2)?,
        page: row.get(3)?,
        flags: ChunkFlags {
            is_page: row.get(4)?,
            is_tag: row.get(5)?,
            is_template: row.get(6)?,
            is_slot: row.get(7)?,
        },
        reference: row.get(8)?,
        tags,
        metadata,
        revision: row.get(11)?,
        created_time_ms: row.get(12)?,
        last_updated_ms: row.get(13)?,
    })
}

pub(in crate::store) fn tags_json(tags: &[String]) -> String {
    Value::from(tags.to_vec()).to_string()
}

fn metadata_json(metadata: &Map<String, Value>) -> String {
    Value::Object(metadata.clone()).to_string()
}

pub(in crate::store) fn load_chunk_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Option<Chunk>, StoreError> {
    let mut stmt = tx.prepare_cached(&format!(
        "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.chunk_id=?1"
    ))?;
    let mut rows = stmt.query(params![chunk_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(chunk_from_row(row)?)),
        None => Ok(None),
    }
}

pub(in crate::store) fn require_chunk_tx(
    tx: &Transaction<'_>,
    op: &'static str,
    role: &'static str,
    chunk_id: &str,
) -> Result<Chunk, StoreError> {
    load_chunk_tx(tx, chunk_id)?.ok_or_else(|| StoreError::not_found(op, role, chunk_id))
}

/// Loads chunks in the order given, silently skipping ids that no longer exist.
pub(in crate::store) fn load_chunks_tx(
    tx: &Transaction<'_>,
    chunk_ids: &[String],
) -> Result<Vec<Chunk>, StoreError> {
    let mut out = Vec::with_capacity(chunk_ids.len());
    for chunk_id in chunk_ids {
        if let Some(chunk) = load_chunk_tx(tx, chunk_id)? {
            out.push(chunk);
        }
    }
    Ok(out)
}

pub(in crate::store) fn chunk_exists_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<bool, StoreError> {
    Ok(tx
        .prepare_cached("SELECT 1 FROM chunks WHERE chunk_id=?1")?
        .query_row(params![chunk_id], |row| row.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// `None` when the chunk does not exist.
pub(in crate::store) fn is_tag_chunk_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Option<bool>, StoreError> {
    Ok(tx
        .prepare_cached("SELECT is_tag FROM chunks WHERE chunk_id=?1")?
        .query_row(params![chunk_id], |row| row.get::<_, bool>(0))
        .optional()?)
}

/// `None` when the chunk does not exist, `Some(None)` for a root.
pub(in crate::store) fn parent_of_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Option<Option<String>>, StoreError> {
    Ok(tx
        .prepare_cached("SELECT parent_id FROM chunks WHERE chunk_id=?1")?
        .query_row(params![chunk_id], |row| row.get::<_, Option<String>>(0))
        .optional()?)
}

pub(in crate::store) fn child_ids_tx(
    tx: &Transaction<'_>,
    parent_id: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT chunk_id FROM chunks WHERE parent_id=?1 ORDER BY created_at_ms ASC, chunk_id ASC",
    )?;
    let mut rows = stmt.query(params![parent_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

pub(in crate::store) fn insert_chunk_tx(
    tx: &Transaction<'_>,
    chunk: &Chunk,
) -> Result<(), StoreError> {
    let insert = tx.execute(
        "INSERT INTO chunks(chunk_id, contents, parent_id, page_id, is_page, is_tag, is_template, is_slot, \
         ref, tags_json, metadata_json, revision, created_at_ms, updated_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            chunk.chunk_id,
            chunk.contents,
            chunk.parent,
            chunk.page,
            chunk.flags.is_page,
            chunk.flags.is_tag,
            chunk.flags.is_template,
            chunk.flags.is_slot,
            chunk.reference,
            tags_json(&chunk.tags),
            metadata_json(&chunk.metadata),
            chunk.revision,
            chunk.created_time_ms,
            chunk.last_updated_ms,
        ],
    );

    match insert {
        Ok(_) => Ok(()),
        Err(err) if is_constraint_violation(&err) => Err(StoreError::AlreadyExists {
            chunk_id: chunk.chunk_id.clone(),
        }),
        Err(err) => Err(StoreError::Sql(err)),
    }
}

/// Overwrites every mutable column; the caller has already bumped the revision.
pub(in crate::store) fn write_chunk_row_tx(
    tx: &Transaction<'_>,
    chunk: &Chunk,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE chunks SET contents=?2, parent_id=?3, page_id=?4, is_page=?5, is_tag=?6, \
         is_template=?7, is_slot=?8, ref=?9, tags_json=?10, metadata_json=?11, revision=?12, \
         updated_at_ms=?13 \
         WHERE chunk_id=?1",
        params![
            chunk.chunk_id,
            chunk.contents,
            chunk.parent,
            chunk.page,
            chunk.flags.is_page,
            chunk.flags.is_tag,
            chunk.flags.is_template,
            chunk.flags.is_slot,
            chunk.reference,
            tags_json(&chunk.tags),
            metadata_json(&chunk.metadata),
            chunk.revision,
            chunk.last_updated_ms,
        ],
    )?;
    Ok(())
}

pub(in crate::store) fn set_tags_field_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
    tags: &[String],
    now_ms: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE chunks SET tags_json=?2, revision=revision+1, updated_at_ms=?3 WHERE chunk_id=?1",
        params![chunk_id, tags_json(tags), now_ms],
    )?;
    Ok(())
}

pub(in crate::store) fn set_parent_field_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
    parent_id: Option<&str>,
    now_ms: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE chunks SET parent_id=?2, revision=revision+1, updated_at_ms=?3 WHERE chunk_id=?1",
        params![chunk_id, parent_id, now_ms],
    )?;
    Ok(())
}
