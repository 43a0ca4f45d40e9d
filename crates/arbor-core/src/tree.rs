use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, NodeId};

/// Leaf chunk: a contiguous slice of the original document.
///
/// Offsets are half-open character offsets (Unicode scalar values) into the
/// document. `overlap_with_prev` is how many leading chars this chunk shares
/// with the end of the previous chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: NodeId,
    pub document_id: DocumentId,
    pub seq: u64,
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
    pub overlap_with_prev: usize,
    pub boundary_rationale: String,
    pub decision_source: DecisionSource,
    pub budget_exceeded: bool,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// Chunk metadata without its text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: NodeId,
    pub document_id: DocumentId,
    pub seq: u64,
    pub start_offset: usize,
    pub end_offset: usize,
    pub overlap_with_prev: usize,
    pub boundary_rationale: String,
    pub decision_source: DecisionSource,
    pub budget_exceeded: bool,
}

impl From<&Chunk> for ChunkInfo {
    fn from(c: &Chunk) -> Self {
        Self {
            id: c.id.clone(),
            document_id: c.document_id.clone(),
            seq: c.seq,
            start_offset: c.start_offset,
            end_offset: c.end_offset,
            overlap_with_prev: c.overlap_with_prev,
            boundary_rationale: c.boundary_rationale.clone(),
            decision_source: c.decision_source,
            budget_exceeded: c.budget_exceeded,
        }
    }
}

/// A node in the summary tree. Level 0 nodes share their id with the leaf
/// chunk they summarize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub document_id: DocumentId,
    pub level: u32,
    /// Order among the nodes of the same level.
    pub position: u64,
    pub summary_text: String,
    pub parent_id: Option<NodeId>,
    pub child_ids: Vec<NodeId>,
    pub degraded: bool,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Where a boundary decision came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Accepted from the fast model.
    Model,
    /// Synthesized deterministically after the model output was rejected.
    Fallback,
    /// Final remainder of the stream, or a document that fit in one window.
    Final,
    /// Fixed-size strategy, no model involved.
    Fixed,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
            Self::Final => "final",
            Self::Fixed => "fixed",
        };
        f.write_str(s)
    }
}

impl FromStr for DecisionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "fallback" => Ok(Self::Fallback),
            "final" => Ok(Self::Final),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown decision source: {other}")),
        }
    }
}

/// Proposed cut within a planning window, as char positions relative to
/// the window start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryDecision {
    pub cut_index: usize,
    pub next_chunk_start_index: usize,
    #[serde(default)]
    pub reasoning: String,
}

impl BoundaryDecision {
    pub fn overlap(&self) -> usize {
        self.cut_index.saturating_sub(self.next_chunk_start_index)
    }
}

/// Lifecycle of a document's index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Segmenting,
    Summarizing,
    Ready,
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Segmenting => "segmenting",
            Self::Summarizing => "summarizing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segmenting" => Ok(Self::Segmenting),
            "summarizing" => Ok(Self::Summarizing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

/// Expected number of levels above the leaves: `ceil(log_g(n))`, computed
/// without floating point.
pub fn expected_depth(leaf_count: u64, group_size: u64) -> u32 {
    if leaf_count <= 1 || group_size < 2 {
        return 0;
    }
    let mut depth = 0;
    let mut nodes = leaf_count;
    while nodes > 1 {
        nodes = nodes.div_ceil(group_size);
        depth += 1;
    }
    depth
}
