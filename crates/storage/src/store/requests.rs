#![forbid(unsafe_code)]

use chunkdb_core::chunk::{ChunkInput, TagMatch};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateChunkRequest {
    /// Generated (UUID v4) when absent.
    pub chunk_id: Option<String>,
    pub input: ChunkInput,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateChunkRequest {
    pub chunk_id: String,
    pub input: ChunkInput,
    pub expected_revision: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteChunkRequest {
    pub chunk_id: String,
    /// Reparent children to the deleted chunk's parent instead of failing.
    pub cascade_children: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeTagsRequest {
    pub chunk_id: String,
    pub tag_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunksByTagRequest {
    pub tag_id: String,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunksByTagsRequest {
    pub tag_ids: Vec<String>,
    pub mode: TagMatch,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescendantsRequest {
    pub ancestor_id: String,
    pub max_depth: Option<usize>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MoveChunkRequest {
    pub chunk_id: String,
    pub new_parent_id: Option<String>,
    pub expected_revision: Option<i64>,
}
