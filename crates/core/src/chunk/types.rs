#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFlags {
    #[serde(default)]
    pub is_page: bool,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_slot: bool,
}

impl ChunkFlags {
    pub fn tag() -> Self {
        Self {
            is_tag: true,
            ..Self::default()
        }
    }

    pub fn page() -> Self {
        Self {
            is_page: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub contents: String,
    pub parent: Option<String>,
    pub page: Option<String>,
    #[serde(flatten)]
    pub flags: ChunkFlags,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub revision: i64,
    pub created_time_ms: i64,
    pub last_updated_ms: i64,
}

/// Caller-controlled fields of a chunk, shared by create and update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    pub contents: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(flatten)]
    pub flags: ChunkFlags,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChunkInput {
    pub fn text(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            ..Self::default()
        }
    }

    pub fn tag(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            flags: ChunkFlags::tag(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&Chunk> for ChunkInput {
    fn from(chunk: &Chunk) -> Self {
        Self {
            contents: chunk.contents.clone(),
            parent: chunk.parent.clone(),
            page: chunk.page.clone(),
            flags: chunk.flags,
            reference: chunk.reference.clone(),
            tags: chunk.tags.clone(),
            metadata: chunk.metadata.clone(),
        }
    }
}

/// Accepts `AND`/`ALL` and `OR`/`ANY` in any case when deserialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum TagMatch {
    /// Chunk carries every requested tag.
    And,
    /// Chunk carries at least one requested tag.
    Or,
}

impl TagMatch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AND" | "ALL" => Some(Self::And),
            "OR" | "ANY" => Some(Self::Or),
            _ => None,
        }
    }
}

impl TryFrom<String> for TagMatch {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown tag match mode: {value:?}"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    pub chunk: Chunk,
    /// Distance from the anchor of the query.
    pub depth: usize,
    /// Ids from ancestor to descendant, both inclusive.
    pub path: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStatistic {
    pub tag_chunk_id: String,
    pub tag_contents: String,
    pub usage_count: i64,
    pub last_used_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag_match: Option<TagMatch>,
    #[serde(default)]
    pub is_page: Option<bool>,
    #[serde(default)]
    pub is_tag: Option<bool>,
    #[serde(default)]
    pub is_template: Option<bool>,
    #[serde(default)]
    pub is_slot: Option<bool>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunks: Vec<Chunk>,
    pub total_count: usize,
    pub has_more: bool,
    pub cache_hit: bool,
}
