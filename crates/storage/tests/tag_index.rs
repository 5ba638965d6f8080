#![forbid(unsafe_code)]

mod support;

use chunkdb_core::chunk::{ChunkInput, TagMatch};
use chunkdb_storage::{
    ChangeTagsRequest, ChunksByTagRequest, ChunksByTagsRequest, SqliteStore, UpdateChunkRequest,
};
use support::{create, create_tag, ids, open_store, raw_conn};

fn by_tag(store: &SqliteStore, tag_id: &str) -> Vec<String> {
    store
        .chunks_by_tag(ChunksByTagRequest {
            tag_id: tag_id.to_string(),
            ..ChunksByTagRequest::default()
        })
        .expect("chunks by tag")
        .into_iter()
        .map(|chunk| chunk.chunk_id)
        .collect()
}

fn by_tags(store: &SqliteStore, tag_ids: &[&str], mode: TagMatch) -> Vec<String> {
    store
        .chunks_by_tags(ChunksByTagsRequest {
            tag_ids: tag_ids.iter().map(|id| id.to_string()).collect(),
            mode,
            limit: None,
            offset: 0,
        })
        .expect("chunks by tags")
        .into_iter()
        .map(|chunk| chunk.chunk_id)
        .collect()
}

fn seed(store: &mut SqliteStore) {
    create_tag(store, "t1", "alpha");
    create_tag(store, "t2", "beta");
    create(store, "A", ChunkInput::text("first").with_tags(["t1", "t2"]));
    create(store, "B", ChunkInput::text("second").with_tags(["t1"]));
}

#[test]
fn lookups_by_tag_follow_creation_order() {
    let (_dir, mut store) = open_store();
    seed(&mut store);

    assert_eq!(by_tag(&store, "t1"), vec!["B", "A"]);
    assert_eq!(by_tag(&store, "t2"), vec!["A"]);
    assert_eq!(by_tags(&store, &["t1", "t2"], TagMatch::And), vec!["A"]);
    assert_eq!(by_tags(&store, &["t1", "t2"], TagMatch::Or), vec!["B", "A"]);
    assert!(by_tags(&store, &[], TagMatch::Or).is_empty());
    assert!(by_tag(&store, "unknown").is_empty());
}

#[test]
fn updating_tags_moves_chunk_between_lookups() {
    let (_dir, mut store) = open_store();
    seed(&mut store);
    assert_eq!(by_tag(&store, "t2"), vec!["A"]);

    let b = store.get_chunk("B").expect("get B");
    let mut input = ChunkInput::from(&b);
    input.tags = vec!["t2".to_string()];
    store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "B".to_string(),
            input,
            expected_revision: Some(b.revision),
        })
        .expect("retag B");

    assert_eq!(by_tag(&store, "t1"), vec!["A"]);
    assert_eq!(by_tag(&store, "t2"), vec!["B", "A"]);
    assert_eq!(by_tags(&store, &["t1", "t2"], TagMatch::And), vec!["A"]);
}

fn relation_created_at(store: &SqliteStore, source_id: &str, tag_id: &str) -> Option<i64> {
    raw_conn(store)
        .query_row(
            "SELECT created_at_ms FROM chunk_tags WHERE source_chunk_id=?1 AND tag_chunk_id=?2",
            [source_id, tag_id],
            |row| row.get(0),
        )
        .ok()
}

#[test]
fn retagging_keeps_timestamps_of_unchanged_relations() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "t1", "alpha");
    create_tag(&mut store, "t2", "beta");
    create(&mut store, "A", ChunkInput::text("first").with_tags(["t1"]));
    let kept = relation_created_at(&store, "A", "t1").expect("initial relation");

    let a = store.get_chunk("A").expect("get A");
    let mut input = ChunkInput::from(&a);
    input.tags = vec!["t2".to_string(), "t1".to_string()];
    store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "A".to_string(),
            input,
            expected_revision: Some(a.revision),
        })
        .expect("retag A");

    assert_eq!(relation_created_at(&store, "A", "t1"), Some(kept));
    let added = relation_created_at(&store, "A", "t2").expect("new relation");
    assert!(added > kept);
    assert_eq!(by_tags(&store, &["t1", "t2"], TagMatch::And), vec!["A"]);
}

#[test]
fn add_and_remove_tags_keep_field_and_index_in_step() {
    let (_dir, mut store) = open_store();
    seed(&mut store);
    create_tag(&mut store, "t3", "gamma");

    let b = store
        .add_tags(ChangeTagsRequest {
            chunk_id: "B".to_string(),
            tag_ids: vec!["t3".to_string(), "t1".to_string()],
        })
        .expect("add tags");
    assert_eq!(b.tags, vec!["t1".to_string(), "t3".to_string()]);
    assert_eq!(by_tag(&store, "t3"), vec!["B"]);

    let unchanged = store
        .add_tags(ChangeTagsRequest {
            chunk_id: "B".to_string(),
            tag_ids: vec!["t3".to_string()],
        })
        .expect("add existing tag");
    assert_eq!(unchanged.revision, b.revision);

    let a = store
        .remove_tags(ChangeTagsRequest {
            chunk_id: "A".to_string(),
            tag_ids: vec!["t1".to_string()],
        })
        .expect("remove tags");
    assert_eq!(a.tags, vec!["t2".to_string()]);
    assert_eq!(by_tag(&store, "t1"), vec!["B"]);

    let err = store
        .add_tags(ChangeTagsRequest {
            chunk_id: "A".to_string(),
            tag_ids: vec!["B".to_string()],
        })
        .expect_err("B is not a tag chunk");
    assert_eq!(err.code(), "VALIDATION");

    assert!(store.check_tag_consistency().expect("check").is_consistent());
}

#[test]
fn chunk_tags_are_ordered_by_contents() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "z", "aardvark");
    create_tag(&mut store, "a", "zebra");
    create(&mut store, "x", ChunkInput::text("x").with_tags(["a", "z"]));

    let tags = store.chunk_tags("x").expect("chunk tags");
    assert_eq!(ids(&tags), vec!["z", "a"]);

    let err = store.chunk_tags("missing").expect_err("unknown chunk");
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn pagination_applies_after_ordering() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "t", "tag");
    for name in ["c1", "c2", "c3", "c4"] {
        create(&mut store, name, ChunkInput::text(name).with_tags(["t"]));
    }

    let page = store
        .chunks_by_tag(ChunksByTagRequest {
            tag_id: "t".to_string(),
            limit: Some(2),
            offset: 1,
        })
        .expect("page");
    assert_eq!(ids(&page), vec!["c3", "c2"]);
}

#[test]
fn tag_statistics_count_usage() {
    let (_dir, mut store) = open_store();
    seed(&mut store);
    create_tag(&mut store, "t3", "unused");

    let stats = store.tag_statistics(None).expect("stats");
    let summary: Vec<(&str, i64)> = stats
        .iter()
        .map(|stat| (stat.tag_chunk_id.as_str(), stat.usage_count))
        .collect();
    assert_eq!(summary, vec![("t1", 2), ("t2", 1), ("t3", 0)]);
    assert_eq!(stats[2].last_used_ms, 0);

    let top = store.tag_statistics(Some(1)).expect("top stats");
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].tag_contents, "alpha");
}
