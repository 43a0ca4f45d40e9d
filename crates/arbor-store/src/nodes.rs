use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::tree::TreeNode;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, document_id, level, position, summary_text, parent_id, degraded";

/// A search hit with its relevance count.
#[derive(Clone, Debug)]
pub struct NodeMatch {
    pub node: TreeNode,
    pub occurrences: usize,
}

/// Summary-tree persistence. Nodes are insert-only apart from the one-time
/// assignment of `parent_id` when their group's parent is created.
pub struct NodeRepo {
    db: Database,
}

impl NodeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist the level-0 node summarizing one leaf chunk. Shares the
    /// chunk's id.
    #[instrument(skip_all, fields(document_id = %document_id, seq = position, level = 0_u32))]
    pub fn insert_leaf(
        &self,
        document_id: &DocumentId,
        chunk_id: &NodeId,
        position: u64,
        summary_text: &str,
        degraded: bool,
    ) -> Result<TreeNode, StoreError> {
        self.db.write_transaction(|conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM chunks WHERE id = ?1 AND document_id = ?2",
                    [chunk_id.as_str(), document_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("chunk {chunk_id}")));
            }
            insert_row(conn, chunk_id, document_id, 0, position, summary_text, degraded)?;
            Ok(())
        })?;

        Ok(TreeNode {
            id: chunk_id.clone(),
            document_id: document_id.clone(),
            level: 0,
            position,
            summary_text: summary_text.to_string(),
            parent_id: None,
            child_ids: Vec::new(),
            degraded,
        })
    }

    /// Persist a parent node and claim its children in one transaction.
    /// Every child must be an unparented node of this document at
    /// `level - 1`; otherwise nothing is written.
    #[instrument(skip_all, fields(document_id = %document_id, level = level, position = position, children = child_ids.len()))]
    pub fn insert_parent(
        &self,
        document_id: &DocumentId,
        level: u32,
        position: u64,
        summary_text: &str,
        degraded: bool,
        child_ids: &[NodeId],
    ) -> Result<TreeNode, StoreError> {
        if level == 0 {
            return Err(StoreError::Conflict("parent nodes start at level 1".into()));
        }
        if child_ids.is_empty() {
            return Err(StoreError::Conflict("parent node needs at least one child".into()));
        }

        let id = NodeId::new();
        self.db.write_transaction(|conn| {
            insert_row(conn, &id, document_id, level, position, summary_text, degraded)?;
            for child in child_ids {
                let claimed = conn.execute(
                    "UPDATE summary_nodes SET parent_id = ?1
                     WHERE id = ?2 AND document_id = ?3 AND level = ?4 AND parent_id IS NULL",
                    rusqlite::params![id.as_str(), child.as_str(), document_id.as_str(), i64::from(level) - 1],
                )?;
                if claimed != 1 {
                    return Err(StoreError::Conflict(format!(
                        "node {child} is missing, already parented, or not at level {}",
                        level - 1
                    )));
                }
            }
            Ok(())
        })?;

        debug!(node_id = %id, "parent node persisted");
        Ok(TreeNode {
            id,
            document_id: document_id.clone(),
            level,
            position,
            summary_text: summary_text.to_string(),
            parent_id: None,
            child_ids: child_ids.to_vec(),
            degraded,
        })
    }

    pub fn get(&self, id: &NodeId) -> Result<TreeNode, StoreError> {
        self.db.with_read_conn(|conn| {
            let node = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM summary_nodes WHERE id = ?1"),
                    [id.as_str()],
                    |row| Ok(row_to_node(row)),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("node {id}")))??;
            with_children(conn, node)
        })
    }

    /// Ordered children of a node. Empty for level-0 nodes.
    pub fn children(&self, id: &NodeId) -> Result<Vec<TreeNode>, StoreError> {
        self.db.with_read_conn(|conn| {
            let exists: Option<String> = conn
                .query_row("SELECT id FROM summary_nodes WHERE id = ?1", [id.as_str()], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("node {id}")));
            }
            query_nodes(
                conn,
                &format!("SELECT {COLUMNS} FROM summary_nodes WHERE parent_id = ?1 ORDER BY position ASC"),
                rusqlite::params![id.as_str()],
            )
        })
    }

    /// Nodes of one level, in position order.
    pub fn by_level(&self, document_id: &DocumentId, level: u32) -> Result<Vec<TreeNode>, StoreError> {
        self.db.with_read_conn(|conn| {
            query_nodes(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM summary_nodes WHERE document_id = ?1 AND level = ?2 ORDER BY position ASC"
                ),
                rusqlite::params![document_id.as_str(), i64::from(level)],
            )
        })
    }

    /// Up to `limit` nodes of one level starting at the `offset`-th in
    /// position order.
    pub fn level_page(
        &self,
        document_id: &DocumentId,
        level: u32,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<TreeNode>, StoreError> {
        self.db.with_read_conn(|conn| {
            query_nodes(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM summary_nodes WHERE document_id = ?1 AND level = ?2
                     ORDER BY position ASC LIMIT ?3 OFFSET ?4"
                ),
                rusqlite::params![document_id.as_str(), i64::from(level), limit as i64, offset as i64],
            )
        })
    }

    /// Nodes without a parent. A finished tree has exactly one.
    pub fn roots(&self, document_id: &DocumentId) -> Result<Vec<TreeNode>, StoreError> {
        self.db.with_read_conn(|conn| {
            query_nodes(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM summary_nodes WHERE document_id = ?1 AND parent_id IS NULL
                     ORDER BY level DESC, position ASC"
                ),
                rusqlite::params![document_id.as_str()],
            )
        })
    }

    /// Highest level present, or `None` for a document with no nodes.
    pub fn depth(&self, document_id: &DocumentId) -> Result<Option<u32>, StoreError> {
        self.db.with_read_conn(|conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(level) FROM summary_nodes WHERE document_id = ?1",
                [document_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(max.map(|m| m.max(0) as u32))
        })
    }

    /// `(level, node count)` pairs, lowest level first.
    pub fn count_by_level(&self, document_id: &DocumentId) -> Result<Vec<(u32, u64)>, StoreError> {
        self.db.with_read_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT level, COUNT(*) FROM summary_nodes WHERE document_id = ?1
                 GROUP BY level ORDER BY level ASC",
            )?;
            let rows = stmt
                .query_map([document_id.as_str()], |row| {
                    let level: i64 = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((level.max(0) as u32, count.max(0) as u64))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Case-insensitive substring search over summary text at every level.
    ///
    /// Matching lowercases both sides with Unicode rules. SQLite's LIKE only
    /// folds ASCII, so it prefilters ASCII terms and is skipped for any term
    /// carrying other letters.
    ///
    /// Ranked by occurrence count, then higher level first, then position.
    pub fn search(
        &self,
        document_id: &DocumentId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<NodeMatch>, StoreError> {
        let term = term.trim();
        if term.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = self.db.with_read_conn(|conn| {
            if term.is_ascii() {
                let pattern = format!("%{}%", row_helpers::escape_like(term));
                query_nodes(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM summary_nodes
                         WHERE document_id = ?1 AND summary_text LIKE ?2 ESCAPE '\\'"
                    ),
                    rusqlite::params![document_id.as_str(), pattern],
                )
            } else {
                query_nodes(
                    conn,
                    &format!("SELECT {COLUMNS} FROM summary_nodes WHERE document_id = ?1"),
                    rusqlite::params![document_id.as_str()],
                )
            }
        })?;

        let mut hits: Vec<NodeMatch> = candidates
            .into_iter()
            .map(|node| {
                let occurrences = row_helpers::count_occurrences(&node.summary_text, term);
                NodeMatch { node, occurrences }
            })
            .filter(|m| m.occurrences > 0)
            .collect();
        hits.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then(b.node.level.cmp(&a.node.level))
                .then(a.node.position.cmp(&b.node.position))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn insert_row(
    conn: &Connection,
    id: &NodeId,
    document_id: &DocumentId,
    level: u32,
    position: u64,
    summary_text: &str,
    degraded: bool,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO summary_nodes (id, document_id, level, position, summary_text, parent_id, degraded, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
        rusqlite::params![
            id.as_str(),
            document_id.as_str(),
            i64::from(level),
            position as i64,
            summary_text,
            degraded,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn query_nodes(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<TreeNode>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_node(row)))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|node| with_children(conn, node?))
        .collect()
}

fn with_children(conn: &Connection, mut node: TreeNode) -> Result<TreeNode, StoreError> {
    if node.level == 0 {
        return Ok(node);
    }
    let mut stmt =
        conn.prepare_cached("SELECT id FROM summary_nodes WHERE parent_id = ?1 ORDER BY position ASC")?;
    node.child_ids = stmt
        .query_map([node.id.as_str()], |row| row.get::<_, String>(0))?
        .map(|r| r.map(NodeId::from_raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(node)
}

fn row_to_node(row: &rusqlite::Row<'_>) -> Result<TreeNode, StoreError> {
    let level: i64 = row_helpers::get(row, 2, "summary_nodes", "level")?;
    let position: i64 = row_helpers::get(row, 3, "summary_nodes", "position")?;
    Ok(TreeNode {
        id: NodeId::from_raw(row_helpers::get::<String>(row, 0, "summary_nodes", "id")?),
        document_id: DocumentId::from_raw(row_helpers::get::<String>(row, 1, "summary_nodes", "document_id")?),
        level: u32::try_from(level).map_err(|_| StoreError::CorruptRow {
            table: "summary_nodes",
            column: "level",
            detail: format!("out of range: {level}"),
        })?,
        position: position.max(0) as u64,
        summary_text: row_helpers::get(row, 4, "summary_nodes", "summary_text")?,
        parent_id: row_helpers::get_opt::<String>(row, 5, "summary_nodes", "parent_id")?.map(NodeId::from_raw),
        child_ids: Vec::new(),
        degraded: row_helpers::get(row, 6, "summary_nodes", "degraded")?,
    })
}
