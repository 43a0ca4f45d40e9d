use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::tree::{Chunk, ChunkInfo};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const INFO_COLUMNS: &str = "id, document_id, seq, start_offset, end_offset, overlap_with_prev, \
                            rationale, decision_source, budget_exceeded";

/// Leaf chunk persistence. Chunks are insert-only.
pub struct ChunkRepo {
    db: Database,
}

impl ChunkRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, chunk), fields(document_id = %chunk.document_id, seq = chunk.seq))]
    pub fn insert(&self, chunk: &Chunk) -> Result<(), StoreError> {
        if chunk.end_offset < chunk.start_offset {
            return Err(StoreError::Conflict(format!(
                "chunk {} has end {} before start {}",
                chunk.id, chunk.end_offset, chunk.start_offset
            )));
        }
        let now = Utc::now().to_rfc3339();
        self.db.write_transaction(|conn| {
            conn.execute(
                "INSERT INTO chunks (id, document_id, seq, start_offset, end_offset, text,
                                     overlap_with_prev, rationale, decision_source, budget_exceeded, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    chunk.id.as_str(),
                    chunk.document_id.as_str(),
                    chunk.seq as i64,
                    chunk.start_offset as i64,
                    chunk.end_offset as i64,
                    chunk.text,
                    chunk.overlap_with_prev as i64,
                    chunk.boundary_rationale,
                    chunk.decision_source.to_string(),
                    chunk.budget_exceeded,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Full chunk including raw text.
    pub fn get(&self, id: &NodeId) -> Result<Chunk, StoreError> {
        self.db.with_read_conn(|conn| {
            conn.query_row(
                &format!("SELECT {INFO_COLUMNS}, text FROM chunks WHERE id = ?1"),
                [id.as_str()],
                |row| Ok(row_to_chunk(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("chunk {id}")))?
        })
    }

    /// Chunk metadata only.
    pub fn info(&self, id: &NodeId) -> Result<ChunkInfo, StoreError> {
        self.db.with_read_conn(|conn| {
            conn.query_row(
                &format!("SELECT {INFO_COLUMNS} FROM chunks WHERE id = ?1"),
                [id.as_str()],
                |row| Ok(row_to_info(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("chunk {id}")))?
        })
    }

    /// All chunk metadata of a document, in emission order.
    pub fn list_info(&self, document_id: &DocumentId) -> Result<Vec<ChunkInfo>, StoreError> {
        self.db.with_read_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INFO_COLUMNS} FROM chunks WHERE document_id = ?1 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map([document_id.as_str()], |row| Ok(row_to_info(row)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    /// All chunks of a document with text, in emission order.
    pub fn list_for_document(&self, document_id: &DocumentId) -> Result<Vec<Chunk>, StoreError> {
        self.db.with_read_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INFO_COLUMNS}, text FROM chunks WHERE document_id = ?1 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map([document_id.as_str()], |row| Ok(row_to_chunk(row)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    pub fn count(&self, document_id: &DocumentId) -> Result<u64, StoreError> {
        self.db.with_read_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                [document_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

fn get_usize(row: &rusqlite::Row<'_>, idx: usize, column: &'static str) -> Result<usize, StoreError> {
    let v: i64 = row_helpers::get(row, idx, "chunks", column)?;
    usize::try_from(v).map_err(|_| StoreError::CorruptRow {
        table: "chunks",
        column,
        detail: format!("negative value {v}"),
    })
}

fn row_to_info(row: &rusqlite::Row<'_>) -> Result<ChunkInfo, StoreError> {
    let source: String = row_helpers::get(row, 7, "chunks", "decision_source")?;
    Ok(ChunkInfo {
        id: NodeId::from_raw(row_helpers::get::<String>(row, 0, "chunks", "id")?),
        document_id: DocumentId::from_raw(row_helpers::get::<String>(row, 1, "chunks", "document_id")?),
        seq: get_usize(row, 2, "seq")? as u64,
        start_offset: get_usize(row, 3, "start_offset")?,
        end_offset: get_usize(row, 4, "end_offset")?,
        overlap_with_prev: get_usize(row, 5, "overlap_with_prev")?,
        boundary_rationale: row_helpers::get(row, 6, "chunks", "rationale")?,
        decision_source: row_helpers::parse_enum(&source, "chunks", "decision_source")?,
        budget_exceeded: row_helpers::get(row, 8, "chunks", "budget_exceeded")?,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> Result<Chunk, StoreError> {
    let info = row_to_info(row)?;
    Ok(Chunk {
        id: info.id,
        document_id: info.document_id,
        seq: info.seq,
        start_offset: info.start_offset,
        end_offset: info.end_offset,
        text: row_helpers::get(row, 9, "chunks", "text")?,
        overlap_with_prev: info.overlap_with_prev,
        boundary_rationale: info.boundary_rationale,
        decision_source: info.decision_source,
        budget_exceeded: info.budget_exceeded,
    })
}
