#![forbid(unsafe_code)]

use super::now_ms;
use crate::cache::{QueryCache, op_prefix, ops, scope_prefix};
use std::collections::BTreeSet;

/// State threaded through one write transaction attempt.
#[derive(Debug)]
pub(in crate::store) struct WriteCtx {
    last_ts_ms: i64,
    pub(in crate::store) max_depth: usize,
    pub(in crate::store) invalidation: Invalidation,
}

impl WriteCtx {
    pub(in crate::store) fn new(last_ts_ms: i64, max_depth: usize) -> Self {
        Self {
            last_ts_ms,
            max_depth,
            invalidation: Invalidation::default(),
        }
    }

    /// Wall-clock millis, forced to be strictly greater than any earlier stamp of this handle.
    pub(in crate::store) fn next_ts(&mut self) -> i64 {
        let ts = now_ms().max(self.last_ts_ms.saturating_add(1));
        self.last_ts_ms = ts;
        ts
    }

    pub(in crate::store) fn last_ts_ms(&self) -> i64 {
        self.last_ts_ms
    }
}

/// Cache prefixes to drop once the transaction has committed.
#[derive(Debug, Default)]
pub(in crate::store) struct Invalidation {
    prefixes: BTreeSet<String>,
}

impl Invalidation {
    pub(in crate::store) fn tag(&mut self, tag_id: &str) {
        self.prefixes.insert(scope_prefix(ops::BY_TAG, tag_id));
        self.prefixes.insert(op_prefix(ops::BY_TAGS));
    }

    pub(in crate::store) fn tags<'a>(&mut self, tag_ids: impl IntoIterator<Item = &'a String>) {
        for tag_id in tag_ids {
            self.tag(tag_id);
        }
    }

    pub(in crate::store) fn chunk_tags(&mut self, chunk_id: &str) {
        self.prefixes.insert(scope_prefix(ops::CHUNK_TAGS, chunk_id));
    }

    /// Tag contents feed the ordering of every `chunk_tags` result.
    pub(in crate::store) fn all_chunk_tags(&mut self) {
        self.prefixes.insert(op_prefix(ops::CHUNK_TAGS));
    }

    pub(in crate::store) fn children(&mut self, parent_id: Option<&str>) {
        if let Some(parent_id) = parent_id {
            self.prefixes.insert(scope_prefix(ops::CHILDREN, parent_id));
        }
    }

    pub(in crate::store) fn descendants<'a>(
        &mut self,
        ancestor_ids: impl IntoIterator<Item = &'a String>,
    ) {
        for ancestor_id in ancestor_ids {
            self.prefixes
                .insert(scope_prefix(ops::DESCENDANTS, ancestor_id));
        }
    }

    pub(in crate::store) fn ancestors<'a>(&mut self, chunk_ids: impl IntoIterator<Item = &'a String>) {
        for chunk_id in chunk_ids {
            self.prefixes.insert(scope_prefix(ops::ANCESTORS, chunk_id));
        }
    }

    /// Every scope anchored at `chunk_id`, used when the chunk disappears.
    pub(in crate::store) fn anchored_at(&mut self, chunk_id: &str) {
        self.tag(chunk_id);
        self.chunk_tags(chunk_id);
        self.children(Some(chunk_id));
        self.prefixes.insert(scope_prefix(ops::DESCENDANTS, chunk_id));
        self.prefixes.insert(scope_prefix(ops::ANCESTORS, chunk_id));
    }

    pub(in crate::store) fn apply(mut self, cache: &QueryCache) {
        self.prefixes.insert(op_prefix(ops::SEARCH));
        for prefix in &self.prefixes {
            cache.invalidate_by_prefix(prefix);
        }
    }
}
