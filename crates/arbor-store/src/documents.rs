use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::tree::DocumentStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored document row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub name: String,
    pub source: Option<String>,
    pub char_len: usize,
    pub status: DocumentStatus,
    pub root_id: Option<NodeId>,
    pub created_at: String,
    pub updated_at: String,
}

const COLUMNS: &str = "id, name, source, char_len, status, root_id, created_at, updated_at";

pub struct DocumentRepo {
    db: Database,
}

impl DocumentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new document in `segmenting` state.
    #[instrument(skip(self, source))]
    pub fn create(&self, name: &str, source: Option<&str>) -> Result<DocumentRecord, StoreError> {
        let id = DocumentId::new();
        let now = Utc::now().to_rfc3339();
        let status = DocumentStatus::Segmenting;

        self.db.write_transaction(|conn| {
            conn.execute(
                "INSERT INTO documents (id, name, source, char_len, status, root_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, NULL, ?5, ?5)",
                rusqlite::params![id.as_str(), name, source, status.to_string(), now],
            )?;
            Ok(())
        })?;

        Ok(DocumentRecord {
            id,
            name: name.to_string(),
            source: source.map(str::to_string),
            char_len: 0,
            status,
            root_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, id: &DocumentId) -> Result<DocumentRecord, StoreError> {
        self.db.with_read_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM documents WHERE id = ?1"),
                [id.as_str()],
                |row| Ok(row_to_document(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))?
        })
    }

    pub fn list(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.db.with_read_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM documents ORDER BY created_at ASC, id ASC"))?;
            let rows = stmt
                .query_map([], |row| Ok(row_to_document(row)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    pub fn set_status(&self, id: &DocumentId, status: DocumentStatus) -> Result<(), StoreError> {
        self.update(id, "status = ?2", rusqlite::params![id.as_str(), status.to_string()])
    }

    pub fn set_char_len(&self, id: &DocumentId, char_len: usize) -> Result<(), StoreError> {
        self.update(id, "char_len = ?2", rusqlite::params![id.as_str(), char_len as i64])
    }

    /// Record the finished root and mark the document ready.
    pub fn mark_ready(&self, id: &DocumentId, root_id: &NodeId) -> Result<(), StoreError> {
        self.update(
            id,
            "root_id = ?2, status = ?3",
            rusqlite::params![id.as_str(), root_id.as_str(), DocumentStatus::Ready.to_string()],
        )
    }

    fn update(
        &self,
        id: &DocumentId,
        set_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.write_transaction(|conn| {
            let rows = conn.execute(
                &format!("UPDATE documents SET {set_clause} WHERE id = ?1"),
                params,
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("document {id}")));
            }
            let _ = conn.execute(
                "UPDATE documents SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![id.as_str(), now],
            )?;
            Ok(())
        })
    }

    /// Drop a document and everything built from it.
    #[instrument(skip(self), fields(document_id = %id))]
    pub fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.db.write_transaction(|conn| {
            let rows = conn.execute("DELETE FROM documents WHERE id = ?1", [id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("document {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> Result<DocumentRecord, StoreError> {
    let status: String = row_helpers::get(row, 4, "documents", "status")?;
    let char_len: i64 = row_helpers::get(row, 3, "documents", "char_len")?;
    Ok(DocumentRecord {
        id: DocumentId::from_raw(row_helpers::get::<String>(row, 0, "documents", "id")?),
        name: row_helpers::get(row, 1, "documents", "name")?,
        source: row_helpers::get_opt(row, 2, "documents", "source")?,
        char_len: char_len.max(0) as usize,
        status: row_helpers::parse_enum(&status, "documents", "status")?,
        root_id: row_helpers::get_opt::<String>(row, 5, "documents", "root_id")?.map(NodeId::from_raw),
        created_at: row_helpers::get(row, 6, "documents", "created_at")?,
        updated_at: row_helpers::get(row, 7, "documents", "updated_at")?,
    })
}
