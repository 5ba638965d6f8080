#![forbid(unsafe_code)]

pub(super) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS store_state (
  singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
  schema_version INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
  chunk_id TEXT PRIMARY KEY,
  contents TEXT NOT NULL,
  parent_id TEXT,
  page_id TEXT,
  is_page INTEGER NOT NULL DEFAULT 0,
  is_tag INTEGER NOT NULL DEFAULT 0,
  is_template INTEGER NOT NULL DEFAULT 0,
  is_slot INTEGER NOT NULL DEFAULT 0,
  ref TEXT,
  tags_json TEXT NOT NULL DEFAULT '[]',
  metadata_json TEXT NOT NULL DEFAULT '{}',
  revision INTEGER NOT NULL,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  CHECK(parent_id IS NULL OR parent_id <> chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_parent_created
  ON chunks(parent_id, created_at_ms, chunk_id);
CREATE INDEX IF NOT EXISTS idx_chunks_page ON chunks(page_id);
CREATE INDEX IF NOT EXISTS idx_chunks_ref ON chunks(ref);
CREATE INDEX IF NOT EXISTS idx_chunks_created ON chunks(created_at_ms, chunk_id);
CREATE INDEX IF NOT EXISTS idx_chunks_is_tag ON chunks(is_tag) WHERE is_tag = 1;

CREATE TABLE IF NOT EXISTS chunk_tags (
  source_chunk_id TEXT NOT NULL,
  tag_chunk_id TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  PRIMARY KEY(source_chunk_id, tag_chunk_id),
  FOREIGN KEY(source_chunk_id) REFERENCES chunks(chunk_id),
  FOREIGN KEY(tag_chunk_id) REFERENCES chunks(chunk_id),
  CHECK(source_chunk_id <> tag_chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_chunk_tags_tag ON chunk_tags(tag_chunk_id, source_chunk_id);

CREATE TABLE IF NOT EXISTS chunk_hierarchy (
  ancestor_id TEXT NOT NULL,
  descendant_id TEXT NOT NULL,
  depth INTEGER NOT NULL CHECK(depth >= 0),
  path_json TEXT NOT NULL,
  PRIMARY KEY(ancestor_id, descendant_id),
  FOREIGN KEY(ancestor_id) REFERENCES chunks(chunk_id),
  FOREIGN KEY(descendant_id) REFERENCES chunks(chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_chunk_hierarchy_descendant
  ON chunk_hierarchy(descendant_id, depth);
CREATE INDEX IF NOT EXISTS idx_chunk_hierarchy_ancestor_depth
  ON chunk_hierarchy(ancestor_id, depth);
"#;
