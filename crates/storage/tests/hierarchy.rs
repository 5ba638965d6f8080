#![forbid(unsafe_code)]

mod support;

use chunkdb_core::chunk::{ChunkInput, HierarchyEntry};
use chunkdb_storage::{
    CreateChunkRequest, DescendantsRequest, MoveChunkRequest, SqliteStore, StoreConfig,
    StoreError, UpdateChunkRequest,
};
use support::{create, ids, open_store, open_store_with};

fn descendants(store: &SqliteStore, ancestor_id: &str, max_depth: Option<usize>) -> Vec<HierarchyEntry> {
    store
        .descendants(DescendantsRequest {
            ancestor_id: ancestor_id.to_string(),
            max_depth,
            ..DescendantsRequest::default()
        })
        .expect("descendants")
}

fn summary(entries: &[HierarchyEntry]) -> Vec<(&str, usize)> {
    entries
        .iter()
        .map(|entry| (entry.chunk.chunk_id.as_str(), entry.depth))
        .collect()
}

fn move_to(store: &mut SqliteStore, chunk_id: &str, parent: Option<&str>) -> Result<(), StoreError> {
    store
        .move_chunk(MoveChunkRequest {
            chunk_id: chunk_id.to_string(),
            new_parent_id: parent.map(str::to_string),
            expected_revision: None,
        })
        .map(|_| ())
}

#[test]
fn descendants_are_breadth_first_and_cycles_are_rejected() {
    let (_dir, mut store) = open_store();
    create(&mut store, "P", ChunkInput::text("parent"));
    create(&mut store, "C1", ChunkInput::text("child").with_parent("P"));
    create(&mut store, "C2", ChunkInput::text("grandchild").with_parent("C1"));

    let entries = descendants(&store, "P", None);
    assert_eq!(summary(&entries), vec![("C1", 1), ("C2", 2)]);
    assert_eq!(entries[1].path, vec!["P", "C1", "C2"]);

    let err = move_to(&mut store, "P", Some("C2")).expect_err("cycle");
    assert!(matches!(
        err,
        StoreError::Cycle { ref chunk_id, ref new_parent_id } if chunk_id == "P" && new_parent_id == "C2"
    ));
    assert_eq!(store.get_chunk("P").expect("P").parent, None);
    assert_eq!(summary(&descendants(&store, "P", None)), vec![("C1", 1), ("C2", 2)]);

    let err = move_to(&mut store, "C1", Some("C1")).expect_err("self parent");
    assert_eq!(err.code(), "CYCLE");
}

#[test]
fn max_depth_bounds_descendants() {
    let (_dir, mut store) = open_store();
    create(&mut store, "P", ChunkInput::text("p"));
    create(&mut store, "C1", ChunkInput::text("c1").with_parent("P"));
    create(&mut store, "C2", ChunkInput::text("c2").with_parent("C1"));
    create(&mut store, "C3", ChunkInput::text("c3").with_parent("P"));

    assert_eq!(summary(&descendants(&store, "P", Some(1))), vec![("C1", 1), ("C3", 1)]);
    assert!(descendants(&store, "P", Some(0)).is_empty());
    assert_eq!(store.subtree_size("P").expect("size"), 3);
    assert_eq!(ids(&store.children("P").expect("children")), vec!["C1", "C3"]);
}

#[test]
fn descendants_paginate_in_breadth_first_order() {
    let (_dir, mut store) = open_store();
    create(&mut store, "P", ChunkInput::text("parent"));
    for child in ["c1", "c2", "c3", "c4", "c5"] {
        create(&mut store, child, ChunkInput::text(child).with_parent("P"));
    }
    create(&mut store, "g1", ChunkInput::text("grandchild").with_parent("c1"));

    let page = |limit: Option<usize>, offset: usize| {
        let entries = store
            .descendants(DescendantsRequest {
                ancestor_id: "P".to_string(),
                max_depth: None,
                limit,
                offset,
            })
            .expect("descendants page");
        summary(&entries)
            .into_iter()
            .map(|(id, depth)| (id.to_string(), depth))
            .collect::<Vec<_>>()
    };

    assert_eq!(page(Some(2), 2), vec![("c3".to_string(), 1), ("c4".to_string(), 1)]);
    assert_eq!(page(Some(2), 4), vec![("c5".to_string(), 1), ("g1".to_string(), 2)]);
    assert!(page(Some(2), 6).is_empty());
    assert_eq!(page(None, 5), vec![("g1".to_string(), 2)]);
}

#[test]
fn ancestors_run_from_root_to_parent() {
    let (_dir, mut store) = open_store();
    create(&mut store, "root", ChunkInput::text("r"));
    create(&mut store, "mid", ChunkInput::text("m").with_parent("root"));
    create(&mut store, "leaf", ChunkInput::text("l").with_parent("mid"));

    let ancestors = store.ancestors("leaf").expect("ancestors");
    assert_eq!(summary(&ancestors), vec![("root", 2), ("mid", 1)]);
    assert_eq!(ancestors[0].path, vec!["root", "mid", "leaf"]);
    assert!(store.ancestors("root").expect("root ancestors").is_empty());
}

#[test]
fn moving_a_subtree_relinks_every_descendant() {
    let (_dir, mut store) = open_store();
    create(&mut store, "A", ChunkInput::text("a"));
    create(&mut store, "B", ChunkInput::text("b"));
    create(&mut store, "X", ChunkInput::text("x").with_parent("A"));
    create(&mut store, "Y", ChunkInput::text("y").with_parent("X"));

    // Warm the cache so the move has something to invalidate.
    assert_eq!(descendants(&store, "A", None).len(), 2);
    assert!(descendants(&store, "B", None).is_empty());

    let moved = store
        .move_chunk(MoveChunkRequest {
            chunk_id: "X".to_string(),
            new_parent_id: Some("B".to_string()),
            expected_revision: Some(1),
        })
        .expect("move");
    assert_eq!(moved.parent.as_deref(), Some("B"));
    assert_eq!(moved.revision, 2);

    assert!(descendants(&store, "A", None).is_empty());
    let under_b = descendants(&store, "B", None);
    assert_eq!(summary(&under_b), vec![("X", 1), ("Y", 2)]);
    assert_eq!(under_b[1].path, vec!["B", "X", "Y"]);
    assert_eq!(summary(&store.ancestors("Y").expect("ancestors")), vec![("B", 2), ("X", 1)]);

    move_to(&mut store, "X", None).expect("detach to root");
    assert!(descendants(&store, "B", None).is_empty());
    assert_eq!(summary(&store.ancestors("Y").expect("ancestors")), vec![("X", 1)]);
    assert!(store.check_hierarchy_integrity().expect("audit").is_empty());
}

#[test]
fn reparenting_through_update_uses_the_same_rules() {
    let (_dir, mut store) = open_store();
    create(&mut store, "A", ChunkInput::text("a"));
    let child = create(&mut store, "C", ChunkInput::text("c").with_parent("A"));

    let mut input = ChunkInput::from(&child);
    input.parent = None;
    store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "C".to_string(),
            input,
            expected_revision: None,
        })
        .expect("update to root");
    assert!(store.children("A").expect("children").is_empty());

    let a = store.get_chunk("A").expect("A");
    let mut input = ChunkInput::from(&a);
    input.parent = Some("C".to_string());
    store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "A".to_string(),
            input,
            expected_revision: None,
        })
        .expect("A under C");
    assert_eq!(summary(&descendants(&store, "C", None)), vec![("A", 1)]);
}

#[test]
fn depth_limit_is_enforced_on_create_and_move() {
    let config = StoreConfig {
        max_hierarchy_depth: 2,
        ..StoreConfig::default()
    };
    let (_dir, mut store) = open_store_with(config);
    create(&mut store, "d0", ChunkInput::text("0"));
    create(&mut store, "d1", ChunkInput::text("1").with_parent("d0"));
    create(&mut store, "d2", ChunkInput::text("2").with_parent("d1"));

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("d3".to_string()),
            input: ChunkInput::text("3").with_parent("d2"),
        })
        .expect_err("too deep");
    assert!(matches!(err, StoreError::DepthLimit { depth: 3, max_depth: 2, .. }));
    assert!(store.get_chunk("d3").is_err());

    create(&mut store, "other", ChunkInput::text("o"));
    create(&mut store, "other_child", ChunkInput::text("oc").with_parent("other"));
    let err = move_to(&mut store, "other", Some("d1")).expect_err("subtree too deep");
    assert_eq!(err.code(), "DEPTH_LIMIT");
    assert_eq!(store.get_chunk("other").expect("other").parent, None);

    move_to(&mut store, "other", Some("d0")).expect("fits at depth 1");
    assert_eq!(summary(&descendants(&store, "d0", Some(1))), vec![("d1", 1), ("other", 1)]);
}

#[test]
fn hierarchy_queries_require_an_existing_anchor() {
    let (_dir, store) = open_store();
    assert_eq!(store.children("ghost").expect_err("children").code(), "NOT_FOUND");
    assert_eq!(store.ancestors("ghost").expect_err("ancestors").code(), "NOT_FOUND");
    assert_eq!(store.subtree_size("ghost").expect_err("size").code(), "NOT_FOUND");
    let err = store
        .descendants(DescendantsRequest {
            ancestor_id: "ghost".to_string(),
            ..DescendantsRequest::default()
        })
        .expect_err("descendants");
    assert_eq!(err.code(), "NOT_FOUND");
}
