#![forbid(unsafe_code)]

use super::support::*;
use super::{SqliteStore, StoreError, canonical_optional_id};
use crate::cache::{CachedResult, cache_key, ops};
use chunkdb_core::chunk::{
    SearchQuery, SearchResult, TagMatch, normalize_tag_ids, sorted_tag_set, validate_metadata_key,
};
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use tracing::debug;

const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 1000;

fn normalize_query(query: &SearchQuery) -> Result<SearchQuery, StoreError> {
    const OP: &str = "search_chunks";
    let content = query
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let tags = normalize_tag_ids(&query.tags)
        .map(|tags| sorted_tag_set(&tags))
        .map_err(|err| StoreError::validation(OP, None, format!("tags: {}", err.message())))?;
    for key in query.metadata.keys() {
        validate_metadata_key(key).map_err(|err| {
            StoreError::validation(OP, None, format!("metadata key {key:?}: {}", err.message()))
        })?;
    }
    let limit = match query.limit {
        0 => DEFAULT_SEARCH_LIMIT,
        limit => limit.min(MAX_SEARCH_LIMIT),
    };

    Ok(SearchQuery {
        content,
        tag_match: if tags.is_empty() {
            None
        } else {
            Some(query.tag_match.unwrap_or(TagMatch::Or))
        },
        tags,
        is_page: query.is_page,
        is_tag: query.is_tag,
        is_template: query.is_template,
        is_slot: query.is_slot,
        parent: canonical_optional_id(OP, "parent", query.parent.as_deref())?,
        page: canonical_optional_id(OP, "page", query.page.as_deref())?,
        metadata: query.metadata.clone(),
        limit,
        offset: query.offset,
    })
}

/// `WHERE` clause and positional values for a normalized query.
fn build_filter(query: &SearchQuery) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if let Some(content) = query.content.as_deref() {
        clauses.push("instr(lower(c.contents), lower(?)) > 0".to_string());
        values.push(SqlValue::Text(content.to_string()));
    }
    for (column, flag) in [
        ("is_page", query.is_page),
        ("is_tag", query.is_tag),
        ("is_template", query.is_template),
        ("is_slot", query.is_slot),
    ] {
        if let Some(flag) = flag {
            clauses.push(format!("c.{column} = ?"));
            values.push(SqlValue::Integer(i64::from(flag)));
        }
    }
    if let Some(parent) = query.parent.as_deref() {
        clauses.push("c.parent_id = ?".to_string());
        values.push(SqlValue::Text(parent.to_string()));
    }
    if let Some(page) = query.page.as_deref() {
        clauses.push("c.page_id = ?".to_string());
        values.push(SqlValue::Text(page.to_string()));
    }
    for (key, expected) in &query.metadata {
        clauses.push("json_extract(c.metadata_json, ?) = ?".to_string());
        values.push(SqlValue::Text(format!("$.\"{key}\"")));
        values.push(SqlValue::Text(expected.clone()));
    }
    if !query.tags.is_empty() {
        let placeholders = vec!["?"; query.tags.len()].join(", ");
        let having = match query.tag_match.unwrap_or(TagMatch::Or) {
            TagMatch::And => " GROUP BY source_chunk_id HAVING COUNT(DISTINCT tag_chunk_id) = ?",
            TagMatch::Or => "",
        };
        clauses.push(format!(
            "c.chunk_id IN (SELECT source_chunk_id FROM chunk_tags \
             WHERE tag_chunk_id IN ({placeholders}){having})"
        ));
        values.extend(query.tags.iter().cloned().map(SqlValue::Text));
        if !having.is_empty() {
            values.push(SqlValue::Integer(query.tags.len() as i64));
        }
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

impl SqliteStore {
    /// Filtered listing, newest first. No relevance ranking.
    pub fn search_chunks(&self, query: &SearchQuery) -> Result<SearchResult, StoreError> {
        const OP: &str = "search_chunks";
        let query = normalize_query(query)?;
        let params = serde_json::to_value(&query).map_err(|err| {
            StoreError::validation(OP, None, format!("query is not serializable: {err}"))
        })?;
        let key = cache_key(ops::SEARCH, "", &params);
        let (where_sql, filter_values) = build_filter(&query);
        let limit = to_sqlite_i64(OP, query.limit)?;
        let offset = to_sqlite_i64(OP, query.offset)?;
        let ttl = Some(self.config.cache.search_ttl);

        let ((chunks, total_count), hit) = self.cached_read(
            OP,
            &key,
            ttl,
            |tx| {
                let total: i64 = tx.query_row(
                    &format!("SELECT COUNT(1) FROM chunks c {where_sql}"),
                    params_from_iter(filter_values.iter()),
                    |row| row.get(0),
                )?;

                let mut values = filter_values.clone();
                values.push(SqlValue::Integer(limit));
                values.push(SqlValue::Integer(offset));
                let mut stmt = tx.prepare(&format!(
                    "SELECT c.chunk_id FROM chunks c {where_sql} \
                     ORDER BY c.created_at_ms DESC, c.chunk_id ASC LIMIT ? OFFSET ?"
                ))?;
                let mut rows = stmt.query(params_from_iter(values.iter()))?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next()? {
                    ids.push(row.get::<_, String>(0)?);
                }
                Ok(CachedResult::with_total(
                    ids,
                    usize::try_from(total).unwrap_or(0),
                ))
            },
            |tx, cached| Ok((load_chunks_tx(tx, &cached.ids)?, cached.total_count)),
        )?;

        let has_more = query.offset + chunks.len() < total_count;
        debug!(
            count = chunks.len(),
            total_count,
            cache_hit = hit,
            "search chunks"
        );
        Ok(SearchResult {
            chunks,
            total_count,
            has_more,
            cache_hit: hit,
        })
    }
}
