#![forbid(unsafe_code)]

use super::hierarchy::reparent_tx;
use super::support::*;
use super::{
    CreateChunkRequest, DeleteChunkRequest, SqliteStore, StoreError, UpdateChunkRequest,
    canonical_id, canonical_optional_id,
};
use chunkdb_core::chunk::{
    Chunk, ChunkFlags, ChunkInput, ChunkReference, internal_ref, normalize_tag_ids,
};
use rusqlite::{Transaction, params};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// Caller input after id canonicalization and tag normalization.
#[derive(Clone, Debug)]
struct PreparedInput {
    contents: String,
    parent: Option<String>,
    page: Option<String>,
    flags: ChunkFlags,
    reference: Option<ChunkReference>,
    tags: Vec<String>,
    metadata: Map<String, Value>,
}

fn prepare_input(op: &'static str, input: &ChunkInput) -> Result<PreparedInput, StoreError> {
    let parent = canonical_optional_id(op, "parent", input.parent.as_deref())?;
    let page = canonical_optional_id(op, "page", input.page.as_deref())?;
    let reference = match input.reference.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(ChunkReference::parse(raw).map_err(|err| {
            StoreError::validation(op, None, format!("ref: {}", err.message()))
        })?),
    };
    let tags = normalize_tag_ids(&input.tags)
        .map_err(|err| StoreError::validation(op, None, format!("tags: {}", err.message())))?;

    Ok(PreparedInput {
        contents: input.contents.clone(),
        parent,
        page,
        flags: input.flags,
        reference,
        tags,
        metadata: input.metadata.clone(),
    })
}

/// Checks that `page` and an internal `ref` resolve. A chunk may name itself.
fn validate_pointers_tx(
    tx: &Transaction<'_>,
    op: &'static str,
    chunk_id: &str,
    input: &PreparedInput,
) -> Result<(), StoreError> {
    if let Some(page) = input.page.as_deref() {
        if page != chunk_id && !chunk_exists_tx(tx, page)? {
            return Err(StoreError::not_found(op, "page", page));
        }
    }
    if let Some(target) = input.reference.as_ref().and_then(ChunkReference::internal_id) {
        if target.as_str() != chunk_id && !chunk_exists_tx(tx, target.as_str())? {
            return Err(StoreError::not_found(op, "ref", target.as_str()));
        }
    }
    validate_tag_targets_tx(tx, op, chunk_id, &input.tags)
}

fn create_chunk_tx(
    tx: &Transaction<'_>,
    ctx: &mut WriteCtx,
    op: &'static str,
    chunk_id: &str,
    input: &PreparedInput,
) -> Result<Chunk, StoreError> {
    if chunk_exists_tx(tx, chunk_id)? {
        return Err(StoreError::AlreadyExists {
            chunk_id: chunk_id.to_string(),
        });
    }
    if let Some(parent) = input.parent.as_deref() {
        if parent == chunk_id {
            return Err(StoreError::Cycle {
                chunk_id: chunk_id.to_string(),
                new_parent_id: parent.to_string(),
            });
        }
        if !chunk_exists_tx(tx, parent)? {
            return Err(StoreError::not_found(op, "parent", parent));
        }
    }
    validate_pointers_tx(tx, op, chunk_id, input)?;

    let now_ms = ctx.next_ts();
    let chunk = Chunk {
        chunk_id: chunk_id.to_string(),
        contents: input.contents.clone(),
        parent: input.parent.clone(),
        page: input.page.clone(),
        flags: input.flags,
        reference: input.reference.as_ref().map(ChunkReference::to_stored),
        tags: input.tags.clone(),
        metadata: input.metadata.clone(),
        revision: 1,
        created_time_ms: now_ms,
        last_updated_ms: now_ms,
    };

    insert_chunk_tx(tx, &chunk)?;
    attach_closure_tx(tx, chunk_id, chunk.parent.as_deref(), ctx.max_depth)?;
    insert_tag_relations_tx(tx, chunk_id, &chunk.tags, now_ms)?;

    ctx.invalidation.tags(&chunk.tags);
    ctx.invalidation.children(chunk.parent.as_deref());
    ctx.invalidation
        .descendants(&strict_ancestor_ids_tx(tx, chunk_id)?);
    Ok(chunk)
}

fn update_chunk_tx(
    tx: &Transaction<'_>,
    ctx: &mut WriteCtx,
    op: &'static str,
    chunk_id: &str,
    input: &PreparedInput,
    expected_revision: Option<i64>,
) -> Result<Chunk, StoreError> {
    let existing = require_chunk_tx(tx, op, "chunk", chunk_id)?;
    if let Some(expected) = expected_revision {
        if expected != existing.revision {
            return Err(StoreError::RevisionMismatch {
                chunk_id: chunk_id.to_string(),
                expected,
                actual: existing.revision,
            });
        }
    }
    if let Some(parent) = input.parent.as_deref() {
        if parent != chunk_id && !chunk_exists_tx(tx, parent)? {
            return Err(StoreError::not_found(op, "parent", parent));
        }
    }
    validate_pointers_tx(tx, op, chunk_id, input)?;

    if existing.flags.is_tag && !input.flags.is_tag {
        let sources = tag_source_ids_tx(tx, chunk_id)?;
        if !sources.is_empty() {
            return Err(StoreError::validation(
                op,
                Some(chunk_id),
                format!(
                    "is_tag cannot be cleared while {} chunk(s) still carry this tag",
                    sources.len()
                ),
            ));
        }
    }

    if existing.parent != input.parent {
        reparent_tx(tx, ctx, chunk_id, existing.parent.as_deref(), input.parent.as_deref())?;
    }

    let now_ms = ctx.next_ts();
    let delta = sync_tag_relations_tx(tx, chunk_id, &input.tags, now_ms)?;

    let chunk = Chunk {
        chunk_id: chunk_id.to_string(),
        contents: input.contents.clone(),
        parent: input.parent.clone(),
        page: input.page.clone(),
        flags: input.flags,
        reference: input.reference.as_ref().map(ChunkReference::to_stored),
        tags: input.tags.clone(),
        metadata: input.metadata.clone(),
        revision: existing.revision + 1,
        created_time_ms: existing.created_time_ms,
        last_updated_ms: now_ms,
    };
    write_chunk_row_tx(tx, &chunk)?;

    if !delta.is_empty() {
        ctx.invalidation.tags(delta.touched());
        ctx.invalidation.chunk_tags(chunk_id);
    }
    if existing.flags.is_tag || chunk.flags.is_tag {
        ctx.invalidation.all_chunk_tags();
    }
    Ok(chunk)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub chunk_id: String,
    /// Children moved to the deleted chunk's parent.
    pub reparented_children: Vec<String>,
    /// Chunks whose `tags` field or relations referenced the deleted tag chunk.
    pub untagged_chunks: Vec<String>,
    /// Chunks whose `page` or internal `ref` pointed at the deleted chunk.
    pub cleared_pointers: usize,
}

fn delete_chunk_tx(
    tx: &Transaction<'_>,
    ctx: &mut WriteCtx,
    op: &'static str,
    chunk_id: &str,
    cascade_children: bool,
) -> Result<DeleteOutcome, StoreError> {
    let existing = require_chunk_tx(tx, op, "chunk", chunk_id)?;
    let children = child_ids_tx(tx, chunk_id)?;
    if !children.is_empty() && !cascade_children {
        return Err(StoreError::HasChildren {
            chunk_id: chunk_id.to_string(),
            children: children.len(),
        });
    }

    let now_ms = ctx.next_ts();
    let grandparent = existing.parent.as_deref();
    ctx.invalidation
        .descendants(&strict_ancestor_ids_tx(tx, chunk_id)?);
    ctx.invalidation.ancestors(&subtree_ids_tx(tx, chunk_id)?);
    ctx.invalidation.children(grandparent);
    ctx.invalidation.anchored_at(chunk_id);

    for child in &children {
        relink_subtree_tx(tx, child, grandparent, ctx.max_depth)?;
        set_parent_field_tx(tx, child, grandparent, now_ms)?;
    }

    let untagged_chunks = detach_tag_everywhere_tx(tx, chunk_id, now_ms)?;
    for source in &untagged_chunks {
        ctx.invalidation.chunk_tags(source);
    }
    let own_tags = clear_tag_relations_tx(tx, chunk_id)?;
    ctx.invalidation.tags(&own_tags);
    ctx.invalidation.tags(&existing.tags);

    let mut cleared_pointers = tx.execute(
        "UPDATE chunks SET page_id=NULL, revision=revision+1, updated_at_ms=?2 \
         WHERE page_id=?1 AND chunk_id<>?1",
        params![chunk_id, now_ms],
    )?;
    cleared_pointers += tx.execute(
        "UPDATE chunks SET ref=NULL, revision=revision+1, updated_at_ms=?2 \
         WHERE ref=?1 AND chunk_id<>?3",
        params![internal_ref(chunk_id), now_ms, chunk_id],
    )?;

    remove_closure_tx(tx, chunk_id)?;
    tx.execute("DELETE FROM chunks WHERE chunk_id=?1", params![chunk_id])?;

    Ok(DeleteOutcome {
        chunk_id: chunk_id.to_string(),
        reparented_children: children,
        untagged_chunks,
        cleared_pointers,
    })
}

impl SqliteStore {
    pub fn create_chunk(&mut self, request: CreateChunkRequest) -> Result<Chunk, StoreError> {
        const OP: &str = "create_chunk";
        let input = prepare_input(OP, &request.input)?;
        let chunk_id = match request.chunk_id.as_deref() {
            Some(raw) => canonical_id(OP, "chunk_id", raw)?,
            None => Uuid::new_v4().to_string(),
        };

        let chunk = self.write_tx(OP, |tx, ctx| create_chunk_tx(tx, ctx, OP, &chunk_id, &input))?;
        debug!(chunk_id = %chunk.chunk_id, tags = chunk.tags.len(), "chunk created");
        Ok(chunk)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<Chunk, StoreError> {
        const OP: &str = "get_chunk";
        let chunk_id = canonical_id(OP, "chunk_id", chunk_id)?;
        self.read_tx(OP, |tx| require_chunk_tx(tx, OP, "chunk", &chunk_id))
    }

    /// Existing chunks among `chunk_ids`, in request order.
    pub fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "get_chunks";
        let chunk_ids = chunk_ids
            .iter()
            .map(|id| canonical_id(OP, "chunk_id", id))
            .collect::<Result<Vec<_>, _>>()?;
        self.read_tx(OP, |tx| load_chunks_tx(tx, &chunk_ids))
    }

    pub fn update_chunk(&mut self, request: UpdateChunkRequest) -> Result<Chunk, StoreError> {
        const OP: &str = "update_chunk";
        let chunk_id = canonical_id(OP, "chunk_id", &request.chunk_id)?;
        let input = prepare_input(OP, &request.input)?;

        let chunk = self.write_tx(OP, |tx, ctx| {
            update_chunk_tx(tx, ctx, OP, &chunk_id, &input, request.expected_revision)
        })?;
        debug!(chunk_id = %chunk.chunk_id, revision = chunk.revision, "chunk updated");
        Ok(chunk)
    }

    pub fn delete_chunk(&mut self, request: DeleteChunkRequest) -> Result<DeleteOutcome, StoreError> {
        const OP: &str = "delete_chunk";
        let chunk_id = canonical_id(OP, "chunk_id", &request.chunk_id)?;

        let outcome = self.write_tx(OP, |tx, ctx| {
            delete_chunk_tx(tx, ctx, OP, &chunk_id, request.cascade_children)
        })?;
        info!(
            chunk_id = %outcome.chunk_id,
            reparented = outcome.reparented_children.len(),
            untagged = outcome.untagged_chunks.len(),
            "chunk deleted"
        );
        Ok(outcome)
    }

    /// All-or-nothing; a failing item surfaces as `StoreError::Batch { index, .. }`.
    pub fn batch_create(&mut self, requests: Vec<CreateChunkRequest>) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "batch_create";
        let mut items = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let prepared = prepare_input(OP, &request.input).map_err(|err| batch_error(index, err))?;
            let chunk_id = match request.chunk_id.as_deref() {
                Some(raw) => canonical_id(OP, "chunk_id", raw).map_err(|err| batch_error(index, err))?,
                None => Uuid::new_v4().to_string(),
            };
            items.push((chunk_id, prepared));
        }

        let chunks = self.write_tx(OP, |tx, ctx| {
            let mut out = Vec::with_capacity(items.len());
            for (index, (chunk_id, input)) in items.iter().enumerate() {
                let chunk = create_chunk_tx(tx, ctx, OP, chunk_id, input)
                    .map_err(|err| batch_error(index, err))?;
                out.push(chunk);
            }
            Ok(out)
        })?;
        debug!(count = chunks.len(), "batch created");
        Ok(chunks)
    }

    pub fn batch_update(&mut self, requests: Vec<UpdateChunkRequest>) -> Result<Vec<Chunk>, StoreError> {
        const OP: &str = "batch_update";
        let mut items = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let chunk_id =
                canonical_id(OP, "chunk_id", &request.chunk_id).map_err(|err| batch_error(index, err))?;
            let prepared = prepare_input(OP, &request.input).map_err(|err| batch_error(index, err))?;
            items.push((chunk_id, prepared, request.expected_revision));
        }

        let chunks = self.write_tx(OP, |tx, ctx| {
            let mut out = Vec::with_capacity(items.len());
            for (index, (chunk_id, input, expected_revision)) in items.iter().enumerate() {
                let chunk = update_chunk_tx(tx, ctx, OP, chunk_id, input, *expected_revision)
                    .map_err(|err| batch_error(index, err))?;
                out.push(chunk);
            }
            Ok(out)
        })?;
        debug!(count = chunks.len(), "batch updated");
        Ok(chunks)
    }
}

fn batch_error(index: usize, source: StoreError) -> StoreError {
    StoreError::Batch {
        index,
        source: Box::new(source),
    }
}
