#![allow(dead_code)]

use chunkdb_core::chunk::{Chunk, ChunkInput};
use chunkdb_storage::{CreateChunkRequest, SqliteStore, StoreConfig};
use tempfile::TempDir;

pub fn open_store() -> (TempDir, SqliteStore) {
    open_store_with(StoreConfig::default())
}

pub fn open_store_with(config: StoreConfig) -> (TempDir, SqliteStore) {
    let dir = TempDir::new().expect("temp dir");
    let store = SqliteStore::open_with_config(dir.path(), config).expect("open store");
    (dir, store)
}

pub fn create(store: &mut SqliteStore, chunk_id: &str, input: ChunkInput) -> Chunk {
    store
        .create_chunk(CreateChunkRequest {
            chunk_id: Some(chunk_id.to_string()),
            input,
        })
        .expect("create chunk")
}

pub fn create_tag(store: &mut SqliteStore, chunk_id: &str, contents: &str) -> Chunk {
    create(store, chunk_id, ChunkInput::tag(contents))
}

pub fn ids(chunks: &[Chunk]) -> Vec<&str> {
    chunks.iter().map(|chunk| chunk.chunk_id.as_str()).collect()
}

/// Raw connection for simulating damage the store itself would never produce.
pub fn raw_conn(store: &SqliteStore) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(store.db_path()).expect("raw connection");
    conn.execute_batch("PRAGMA foreign_keys = OFF;")
        .expect("disable foreign keys");
    conn
}
