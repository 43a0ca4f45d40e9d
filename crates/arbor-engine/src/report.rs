use serde::{Deserialize, Serialize};

use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::tree::DocumentStatus;

/// A segmentation step that used the deterministic fallback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    /// Sequence number of the chunk the fallback produced.
    pub seq: u64,
    pub start_offset: usize,
    /// Short classification, e.g. `timeout` or `cut_out_of_range`.
    pub kind: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStage {
    /// A single char did not fit the decision window.
    Segmentation,
    /// A group's concatenated summaries were clipped to the chunk budget.
    GroupSummary,
}

/// Content processed over budget. Never dropped silently; always reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub stage: BudgetStage,
    pub level: u32,
    pub position: u64,
    pub detail: String,
}

/// Outcome of one ingestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub document_id: DocumentId,
    pub status: DocumentStatus,
    pub char_len: usize,
    pub total_chunks: u64,
    /// Levels including the leaf level.
    pub total_levels: u32,
    /// Levels above the leaves: `ceil(log_g(chunks))`.
    pub depth: u32,
    pub root_id: Option<NodeId>,
    pub fallback_decisions: Vec<FallbackRecord>,
    pub degraded_nodes: Vec<NodeId>,
    pub budget_warnings: Vec<BudgetWarning>,
    pub structural_errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl BuildReport {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            status: DocumentStatus::Segmenting,
            char_len: 0,
            total_chunks: 0,
            total_levels: 0,
            depth: 0,
            root_id: None,
            fallback_decisions: Vec::new(),
            degraded_nodes: Vec::new(),
            budget_warnings: Vec::new(),
            structural_errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// The tree is complete and queryable.
    pub fn is_complete(&self) -> bool {
        self.status == DocumentStatus::Ready && self.root_id.is_some()
    }
}
