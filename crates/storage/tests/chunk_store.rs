#![forbid(unsafe_code)]

mod support;

use chunkdb_core::chunk::{ChunkFlags, ChunkInput, internal_ref};
use chunkdb_storage::{
    ChunksByTagRequest, CreateChunkRequest, DeleteChunkRequest, RetryPolicy, SqliteStore,
    StoreConfig, StoreError, UpdateChunkRequest,
};
use std::time::Duration;
use support::{create, create_tag, ids, open_store, open_store_with, raw_conn};
use tempfile::TempDir;

#[test]
fn create_then_get_returns_stored_chunk() {
    let (_dir, mut store) = open_store();
    let created = store
        .create_chunk(CreateChunkRequest {
            chunk_id: None,
            input: ChunkInput::text("hello"),
        })
        .expect("create chunk");

    assert!(uuid_like(&created.chunk_id), "generated id: {}", created.chunk_id);
    assert_eq!(created.revision, 1);
    assert_eq!(created.created_time_ms, created.last_updated_ms);
    assert!(created.tags.is_empty());

    let loaded = store.get_chunk(&created.chunk_id).expect("get chunk");
    assert_eq!(loaded, created);
}

fn uuid_like(value: &str) -> bool {
    value.len() == 36 && value.chars().filter(|ch| *ch == '-').count() == 4
}

#[test]
fn duplicate_and_invalid_ids_are_rejected() {
    let (_dir, mut store) = open_store();
    create(&mut store, "a", ChunkInput::text("first"));

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("a".to_string()),
            input: ChunkInput::text("again"),
        })
        .expect_err("duplicate id");
    assert!(matches!(err, StoreError::AlreadyExists { ref chunk_id } if chunk_id == "a"));

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("bad|id".to_string()),
            input: ChunkInput::text("x"),
        })
        .expect_err("pipe in id");
    assert_eq!(err.code(), "VALIDATION");

    let err = store.get_chunk("missing").expect_err("missing chunk");
    assert_eq!(err.code(), "NOT_FOUND");
}

#[test]
fn missing_parent_and_self_parent_fail() {
    let (_dir, mut store) = open_store();

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("child".to_string()),
            input: ChunkInput::text("x").with_parent("ghost"),
        })
        .expect_err("missing parent");
    assert!(matches!(err, StoreError::NotFound { role: "parent", ref chunk_id, .. } if chunk_id == "ghost"));

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("loop".to_string()),
            input: ChunkInput::text("x").with_parent("loop"),
        })
        .expect_err("self parent");
    assert_eq!(err.code(), "CYCLE");
    assert!(store.get_chunk("loop").is_err());
}

#[test]
fn tags_must_name_existing_tag_chunks() {
    let (_dir, mut store) = open_store();
    create(&mut store, "plain", ChunkInput::text("not a tag"));

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("a".to_string()),
            input: ChunkInput::text("x").with_tags(["plain"]),
        })
        .expect_err("non-tag target");
    assert_eq!(err.code(), "VALIDATION");

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("a".to_string()),
            input: ChunkInput::text("x").with_tags(["nowhere"]),
        })
        .expect_err("missing tag");
    assert!(matches!(err, StoreError::NotFound { role: "tag", .. }));
}

#[test]
fn update_bumps_revision_and_checks_expected_revision() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "t1", "one");
    let chunk = create(&mut store, "a", ChunkInput::text("v1"));

    let mut input = ChunkInput::from(&chunk);
    input.contents = "v2".to_string();
    input.tags = vec!["t1".to_string()];
    let updated = store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "a".to_string(),
            input: input.clone(),
            expected_revision: Some(1),
        })
        .expect("update");
    assert_eq!(updated.revision, 2);
    assert_eq!(updated.contents, "v2");
    assert_eq!(updated.tags, vec!["t1".to_string()]);
    assert_eq!(updated.created_time_ms, chunk.created_time_ms);
    assert!(updated.last_updated_ms > chunk.last_updated_ms);

    let err = store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "a".to_string(),
            input,
            expected_revision: Some(1),
        })
        .expect_err("stale revision");
    assert!(matches!(
        err,
        StoreError::RevisionMismatch {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    assert_eq!(store.get_chunk("a").expect("get").revision, 2);
}

#[test]
fn clearing_is_tag_on_a_used_tag_is_rejected() {
    let (_dir, mut store) = open_store();
    let tag = create_tag(&mut store, "t1", "one");
    create(&mut store, "a", ChunkInput::text("x").with_tags(["t1"]));

    let mut input = ChunkInput::from(&tag);
    input.flags = ChunkFlags::default();
    let err = store
        .update_chunk(UpdateChunkRequest {
            chunk_id: "t1".to_string(),
            input,
            expected_revision: None,
        })
        .expect_err("tag still in use");
    assert_eq!(err.code(), "VALIDATION");
    assert!(store.get_chunk("t1").expect("get").flags.is_tag);
}

#[test]
fn batch_create_is_all_or_nothing() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "t1", "one");

    let err = store
        .batch_create(vec![
            CreateChunkRequest {
                chunk_id: Some("a".to_string()),
                input: ChunkInput::text("ok").with_tags(["t1"]),
            },
            CreateChunkRequest {
                chunk_id: Some("b".to_string()),
                input: ChunkInput::text("broken").with_tags(["missing"]),
            },
        ])
        .expect_err("second item fails");

    match &err {
        StoreError::Batch { index, source } => {
            assert_eq!(*index, 1);
            assert_eq!(source.code(), "NOT_FOUND");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), "NOT_FOUND");
    assert!(store.get_chunk("a").is_err());
    let tagged = store
        .chunks_by_tag(ChunksByTagRequest {
            tag_id: "t1".to_string(),
            ..ChunksByTagRequest::default()
        })
        .expect("by tag");
    assert!(tagged.is_empty());

    let created = store
        .batch_create(vec![
            CreateChunkRequest {
                chunk_id: Some("p".to_string()),
                input: ChunkInput::text("parent"),
            },
            CreateChunkRequest {
                chunk_id: Some("c".to_string()),
                input: ChunkInput::text("child").with_parent("p"),
            },
        ])
        .expect("batch with in-batch parent");
    assert_eq!(ids(&created), vec!["p", "c"]);
}

#[test]
fn batch_update_rolls_back_on_revision_conflict() {
    let (_dir, mut store) = open_store();
    let a = create(&mut store, "a", ChunkInput::text("a1"));
    let b = create(&mut store, "b", ChunkInput::text("b1"));

    let mut a_input = ChunkInput::from(&a);
    a_input.contents = "a2".to_string();
    let mut b_input = ChunkInput::from(&b);
    b_input.contents = "b2".to_string();

    let err = store
        .batch_update(vec![
            UpdateChunkRequest {
                chunk_id: "a".to_string(),
                input: a_input,
                expected_revision: Some(1),
            },
            UpdateChunkRequest {
                chunk_id: "b".to_string(),
                input: b_input,
                expected_revision: Some(7),
            },
        ])
        .expect_err("conflict");
    assert!(matches!(err, StoreError::Batch { index: 1, .. }));
    assert!(matches!(err.root(), StoreError::RevisionMismatch { .. }));
    assert_eq!(err.code(), "REVISION_MISMATCH");
    assert_eq!(store.get_chunk("a").expect("get").contents, "a1");
}

#[test]
fn delete_with_children_requires_cascade() {
    let (_dir, mut store) = open_store();
    create(&mut store, "root", ChunkInput::text("root"));
    create(&mut store, "mid", ChunkInput::text("mid").with_parent("root"));
    create(&mut store, "leaf", ChunkInput::text("leaf").with_parent("mid"));

    let err = store
        .delete_chunk(DeleteChunkRequest {
            chunk_id: "mid".to_string(),
            cascade_children: false,
        })
        .expect_err("has children");
    assert!(matches!(err, StoreError::HasChildren { children: 1, .. }));

    let outcome = store
        .delete_chunk(DeleteChunkRequest {
            chunk_id: "mid".to_string(),
            cascade_children: true,
        })
        .expect("cascade delete");
    assert_eq!(outcome.reparented_children, vec!["leaf".to_string()]);

    let leaf = store.get_chunk("leaf").expect("leaf survives");
    assert_eq!(leaf.parent.as_deref(), Some("root"));
    assert_eq!(ids(&store.children("root").expect("children")), vec!["leaf"]);
    let ancestors = store.ancestors("leaf").expect("ancestors");
    assert_eq!(ancestors.len(), 1);
    assert_eq!(ancestors[0].chunk.chunk_id, "root");
    assert_eq!(ancestors[0].depth, 1);
}

#[test]
fn deleting_a_tag_chunk_detaches_it_everywhere() {
    let (_dir, mut store) = open_store();
    create_tag(&mut store, "t1", "one");
    create_tag(&mut store, "t2", "two");
    create(&mut store, "a", ChunkInput::text("a").with_tags(["t1", "t2"]));
    let page = create(&mut store, "pg", ChunkInput {
        contents: "page".to_string(),
        flags: ChunkFlags::page(),
        ..ChunkInput::default()
    });
    create(&mut store, "b", ChunkInput {
        contents: "b".to_string(),
        page: Some(page.chunk_id.clone()),
        reference: Some(internal_ref("t1")),
        tags: vec!["t1".to_string()],
        ..ChunkInput::default()
    });

    let outcome = store
        .delete_chunk(DeleteChunkRequest {
            chunk_id: "t1".to_string(),
            cascade_children: false,
        })
        .expect("delete tag");
    assert_eq!(outcome.untagged_chunks, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(outcome.cleared_pointers, 1);

    let a = store.get_chunk("a").expect("a");
    assert_eq!(a.tags, vec!["t2".to_string()]);
    assert_eq!(a.revision, 2);
    let b = store.get_chunk("b").expect("b");
    assert!(b.tags.is_empty());
    assert_eq!(b.reference, None);
    assert_eq!(b.page.as_deref(), Some("pg"));

    assert!(store.chunk_tags("a").map(|tags| ids(&tags) == vec!["t2"]).unwrap_or(false));
    assert!(store.check_tag_consistency().expect("check").is_consistent());
}

#[test]
fn get_chunks_keeps_request_order_and_skips_missing() {
    let (_dir, mut store) = open_store();
    create(&mut store, "a", ChunkInput::text("a"));
    create(&mut store, "b", ChunkInput::text("b"));

    let found = store
        .get_chunks(&["b".to_string(), "ghost".to_string(), "a".to_string()])
        .expect("get chunks");
    assert_eq!(ids(&found), vec!["b", "a"]);
}

#[test]
fn reopen_preserves_data_and_unknown_layout_requires_reset() {
    let dir = TempDir::new().expect("temp dir");
    {
        let mut store = SqliteStore::open(dir.path()).expect("open");
        create(&mut store, "a", ChunkInput::text("kept"));
    }
    let store = SqliteStore::open(dir.path()).expect("reopen");
    assert_eq!(store.get_chunk("a").expect("get").contents, "kept");
    drop(store);

    let foreign = TempDir::new().expect("temp dir");
    let conn = rusqlite::Connection::open(foreign.path().join("chunkdb.db")).expect("raw db");
    conn.execute_batch("CREATE TABLE notes(id TEXT PRIMARY KEY);")
        .expect("foreign table");
    drop(conn);

    let err = SqliteStore::open(foreign.path()).expect_err("foreign layout");
    match err {
        StoreError::Validation { constraint, .. } => {
            assert!(constraint.starts_with("RESET_REQUIRED"), "{constraint}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn concurrent_writers_keep_indexes_consistent() {
    let (dir, mut store) = open_store();
    create_tag(&mut store, "t1", "shared");
    create(&mut store, "P", ChunkInput::text("parent"));

    let workers: Vec<_> = (0..2)
        .map(|worker| {
            let path = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let mut handle = SqliteStore::open(&path).expect("worker handle");
                for i in 0..20 {
                    let input = ChunkInput::text(format!("w{worker} #{i}"))
                        .with_parent("P")
                        .with_tags(["t1"]);
                    create(&mut handle, &format!("w{worker}-{i}"), input);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("writer thread");
    }

    let tagged = store
        .chunks_by_tag(ChunksByTagRequest {
            tag_id: "t1".to_string(),
            ..ChunksByTagRequest::default()
        })
        .expect("by tag");
    assert_eq!(tagged.len(), 40);
    assert_eq!(store.children("P").expect("children").len(), 40);
    assert_eq!(store.subtree_size("P").expect("subtree"), 40);
    assert!(store.check_all().expect("consistency").is_clean());
}

#[test]
fn write_gives_up_after_retry_budget_when_database_stays_locked() {
    let config = StoreConfig {
        busy_timeout: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 1.0,
        },
        ..StoreConfig::default()
    };
    let (_dir, mut store) = open_store_with(config);

    let blocker = raw_conn(&store);
    blocker.execute_batch("BEGIN IMMEDIATE;").expect("hold write lock");

    let err = store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some("a".to_string()),
            input: ChunkInput::text("blocked"),
        })
        .expect_err("locked database");
    assert!(matches!(err, StoreError::Transaction { attempts: 2, .. }), "{err:?}");
    assert_eq!(err.code(), "TRANSACTION");
    assert!(store.get_chunk("a").is_err());

    blocker.execute_batch("ROLLBACK;").expect("release write lock");
    create(&mut store, "a", ChunkInput::text("unblocked"));
    assert_eq!(store.get_chunk("a").expect("get").contents, "unblocked");
}
