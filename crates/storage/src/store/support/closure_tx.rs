#![forbid(unsafe_code)]

//! Closure-table maintenance: one `(ancestor, descendant, depth, path)` row per
//! ancestor of every chunk, including the depth-0 self row.

use super::super::StoreError;
use rusqlite::{OptionalExtension, Transaction, params};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(in crate::store) struct ClosureRow {
    pub(in crate::store) ancestor_id: String,
    pub(in crate::store) descendant_id: String,
    pub(in crate::store) depth: usize,
    pub(in crate::store) path: Vec<String>,
}

pub(in crate::store) fn path_json(path: &[String]) -> String {
    Value::from(path.to_vec()).to_string()
}

fn closure_row(
    ancestor_id: String,
    descendant_id: String,
    depth: i64,
    path_json: &str,
) -> Result<ClosureRow, StoreError> {
    let corrupt = || StoreError::Consistency {
        chunk_id: descendant_id.clone(),
        mismatch_type: "corrupt_closure_row",
    };
    let depth = usize::try_from(depth).map_err(|_| corrupt())?;
    let path = serde_json::from_str::<Vec<String>>(path_json).map_err(|_| corrupt())?;
    Ok(ClosureRow {
        ancestor_id,
        descendant_id,
        depth,
        path,
    })
}

fn query_closure_rows(
    tx: &Transaction<'_>,
    sql: &str,
    anchor_id: &str,
) -> Result<Vec<ClosureRow>, StoreError> {
    let mut stmt = tx.prepare_cached(sql)?;
    let mut rows = stmt.query(params![anchor_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let path: String = row.get(3)?;
        out.push(closure_row(row.get(0)?, row.get(1)?, row.get(2)?, &path)?);
    }
    Ok(out)
}

/// Rows where `chunk_id` is the descendant, self row first.
pub(in crate::store) fn ancestor_rows_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Vec<ClosureRow>, StoreError> {
    query_closure_rows(
        tx,
        "SELECT ancestor_id, descendant_id, depth, path_json FROM chunk_hierarchy \
         WHERE descendant_id=?1 ORDER BY depth ASC",
        chunk_id,
    )
}

/// Rows where `chunk_id` is the ancestor, self row first.
pub(in crate::store) fn descendant_rows_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Vec<ClosureRow>, StoreError> {
    query_closure_rows(
        tx,
        "SELECT ancestor_id, descendant_id, depth, path_json FROM chunk_hierarchy \
         WHERE ancestor_id=?1 ORDER BY depth ASC, descendant_id ASC",
        chunk_id,
    )
}

pub(in crate::store) fn closure_row_tx(
    tx: &Transaction<'_>,
    ancestor_id: &str,
    descendant_id: &str,
) -> Result<Option<ClosureRow>, StoreError> {
    let raw = tx
        .prepare_cached(
            "SELECT depth, path_json FROM chunk_hierarchy WHERE ancestor_id=?1 AND descendant_id=?2",
        )?
        .query_row(params![ancestor_id, descendant_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;
    match raw {
        Some((depth, path)) => Ok(Some(closure_row(
            ancestor_id.to_string(),
            descendant_id.to_string(),
            depth,
            &path,
        )?)),
        None => Ok(None),
    }
}

pub(in crate::store) fn strict_ancestor_ids_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Vec<String>, StoreError> {
    Ok(ancestor_rows_tx(tx, chunk_id)?
        .into_iter()
        .filter(|row| row.depth > 0)
        .map(|row| row.ancestor_id)
        .collect())
}

pub(in crate::store) fn subtree_ids_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<Vec<String>, StoreError> {
    Ok(descendant_rows_tx(tx, chunk_id)?
        .into_iter()
        .map(|row| row.descendant_id)
        .collect())
}

/// Distance from the root of `chunk_id`'s tree.
fn depth_from_root_tx(tx: &Transaction<'_>, chunk_id: &str) -> Result<usize, StoreError> {
    let depth = tx
        .prepare_cached("SELECT COALESCE(MAX(depth), 0) FROM chunk_hierarchy WHERE descendant_id=?1")?
        .query_row(params![chunk_id], |row| row.get::<_, i64>(0))?;
    Ok(usize::try_from(depth).unwrap_or(0))
}

fn is_strict_descendant_tx(
    tx: &Transaction<'_>,
    ancestor_id: &str,
    candidate_id: &str,
) -> Result<bool, StoreError> {
    Ok(tx
        .prepare_cached(
            "SELECT 1 FROM chunk_hierarchy WHERE ancestor_id=?1 AND descendant_id=?2 AND depth > 0",
        )?
        .query_row(params![ancestor_id, candidate_id], |row| row.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn insert_closure_row_tx(
    tx: &Transaction<'_>,
    ancestor_id: &str,
    descendant_id: &str,
    depth: usize,
    path: &[String],
) -> Result<(), StoreError> {
    let depth = i64::try_from(depth).map_err(|_| {
        StoreError::validation("closure", Some(descendant_id), "numeric overflow")
    })?;
    tx.prepare_cached(
        "INSERT INTO chunk_hierarchy(ancestor_id, descendant_id, depth, path_json) \
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![ancestor_id, descendant_id, depth, path_json(path)])?;
    Ok(())
}

/// Inserts the rows of a freshly created leaf. Fails before writing if the leaf
/// would sit deeper than `max_depth`.
pub(in crate::store) fn attach_closure_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
    parent_id: Option<&str>,
    max_depth: usize,
) -> Result<(), StoreError> {
    let parent_rows = match parent_id {
        Some(parent_id) => ancestor_rows_tx(tx, parent_id)?,
        None => Vec::new(),
    };
    let depth = parent_rows.iter().map(|row| row.depth + 1).max().unwrap_or(0);
    if depth > max_depth {
        return Err(StoreError::DepthLimit {
            chunk_id: chunk_id.to_string(),
            depth,
            max_depth,
        });
    }

    insert_closure_row_tx(tx, chunk_id, chunk_id, 0, &[chunk_id.to_string()])?;
    for row in parent_rows {
        let mut path = row.path;
        path.push(chunk_id.to_string());
        insert_closure_row_tx(tx, &row.ancestor_id, chunk_id, row.depth + 1, &path)?;
    }
    Ok(())
}

/// Moves the subtree rooted at `chunk_id` under `new_parent_id` (or makes it a root).
/// Cycle and depth checks run before any row changes.
pub(in crate::store) fn relink_subtree_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
    new_parent_id: Option<&str>,
    max_depth: usize,
) -> Result<(), StoreError> {
    if let Some(new_parent_id) = new_parent_id {
        if new_parent_id == chunk_id || is_strict_descendant_tx(tx, chunk_id, new_parent_id)? {
            return Err(StoreError::Cycle {
                chunk_id: chunk_id.to_string(),
                new_parent_id: new_parent_id.to_string(),
            });
        }
    }

    let subtree = descendant_rows_tx(tx, chunk_id)?;
    let height = subtree.iter().map(|row| row.depth).max().unwrap_or(0);
    let (anchor_rows, new_depth) = match new_parent_id {
        Some(new_parent_id) => (
            ancestor_rows_tx(tx, new_parent_id)?,
            depth_from_root_tx(tx, new_parent_id)? + 1,
        ),
        None => (Vec::new(), 0),
    };
    if new_depth + height > max_depth {
        return Err(StoreError::DepthLimit {
            chunk_id: chunk_id.to_string(),
            depth: new_depth + height,
            max_depth,
        });
    }

    let old_ancestors = strict_ancestor_ids_tx(tx, chunk_id)?;
    {
        let mut delete = tx.prepare_cached(
            "DELETE FROM chunk_hierarchy WHERE ancestor_id=?1 AND descendant_id=?2",
        )?;
        for ancestor_id in &old_ancestors {
            for member in &subtree {
                delete.execute(params![ancestor_id, member.descendant_id])?;
            }
        }
    }

    for anchor in &anchor_rows {
        for member in &subtree {
            let mut path = anchor.path.clone();
            path.extend(member.path.iter().cloned());
            insert_closure_row_tx(
                tx,
                &anchor.ancestor_id,
                &member.descendant_id,
                anchor.depth + 1 + member.depth,
                &path,
            )?;
        }
    }
    Ok(())
}

pub(in crate::store) fn remove_closure_tx(
    tx: &Transaction<'_>,
    chunk_id: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM chunk_hierarchy WHERE ancestor_id=?1 OR descendant_id=?1",
        params![chunk_id],
    )?;
    Ok(())
}
