/// SQL DDL for the arbor tree store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source TEXT,
    char_len INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'segmenting',
    root_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    text TEXT NOT NULL,
    overlap_with_prev INTEGER NOT NULL DEFAULT 0,
    rationale TEXT NOT NULL,
    decision_source TEXT NOT NULL,
    budget_exceeded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (document_id, seq)
);

CREATE TABLE IF NOT EXISTS summary_nodes (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    level INTEGER NOT NULL,
    position INTEGER NOT NULL,
    summary_text TEXT NOT NULL,
    parent_id TEXT,
    degraded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (document_id, level, position)
);

CREATE INDEX IF NOT EXISTS idx_chunks_document_seq ON chunks(document_id, seq);
CREATE INDEX IF NOT EXISTS idx_nodes_document_level ON summary_nodes(document_id, level, position);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON summary_nodes(parent_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
