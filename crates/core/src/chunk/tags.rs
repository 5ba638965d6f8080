#![forbid(unsafe_code)]

use super::ids::{ChunkId, ChunkIdError};
use std::collections::BTreeSet;

/// Trims, drops blanks and de-duplicates while keeping the caller's order.
pub fn normalize_tag_ids(tags: &[String]) -> Result<Vec<String>, ChunkIdError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        if tag.trim().is_empty() {
            continue;
        }
        let id = ChunkId::try_new(tag.as_str())?.into_string();
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    Ok(out)
}

/// Sorted, de-duplicated form used for set comparisons and cache keys.
pub fn sorted_tag_set(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TagDelta {
    pub fn between(old: &[String], new: &[String]) -> Self {
        let old_set: BTreeSet<&str> = old.iter().map(String::as_str).collect();
        let new_set: BTreeSet<&str> = new.iter().map(String::as_str).collect();
        let added = new
            .iter()
            .filter(|tag| !old_set.contains(tag.as_str()))
            .cloned()
            .collect();
        let removed = old
            .iter()
            .filter(|tag| !new_set.contains(tag.as_str()))
            .cloned()
            .collect();
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.removed.iter())
    }
}

pub fn same_tag_set(left: &[String], right: &[String]) -> bool {
    sorted_tag_set(left) == sorted_tag_set(right)
}
