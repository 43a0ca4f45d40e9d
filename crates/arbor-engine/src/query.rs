//! Read-only navigation over finished trees. Nothing here hands out raw
//! chunk text: structure and search return bounded snippets of summaries,
//! and chunk analysis returns only the delegated answer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use arbor_core::errors::GatewayError;
use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::provider::{CallOptions, CompletionRequest, LlmProvider};
use arbor_core::tree::{ChunkInfo, DocumentStatus, TreeNode};
use arbor_settings::IndexConfig;
use arbor_store::{ChunkRepo, Database, DocumentRecord, DocumentRepo, NodeRepo, StoreError};

use crate::prompts;
use crate::retry::complete_with_policy;
use crate::truncate::{preview, snippet_around};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("document {document_id} is not ready (status {status})")]
    NotReady {
        document_id: DocumentId,
        status: DocumentStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("analysis failed: {0}")]
    Gateway(GatewayError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::NotReady { .. } => true,
            Self::Gateway(e) => e.is_retryable() || matches!(e, GatewayError::Timeout(_)),
            Self::Store(e) => e.is_retryable(),
            Self::NotFound(_) | Self::InvalidRequest(_) => false,
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

impl From<GatewayError> for QueryError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Cancelled => Self::Cancelled,
            other => Self::Gateway(other),
        }
    }
}

/// One node as shown in a table of contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOverview {
    pub id: NodeId,
    pub level: u32,
    pub position: u64,
    pub snippet: String,
    pub child_count: usize,
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub node_id: NodeId,
    pub level: u32,
    pub position: u64,
    pub snippet: String,
    pub occurrences: usize,
}

/// What examining a node yields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Examination {
    /// A summary node: its own summary and its children.
    Summary {
        node: NodeOverview,
        summary: String,
        children: Vec<NodeOverview>,
    },
    /// A leaf examined with a question: the delegated answer.
    Answer { chunk: ChunkInfo, answer: String },
}

pub struct QuerySurface {
    documents: DocumentRepo,
    chunks: ChunkRepo,
    nodes: NodeRepo,
    analyst: Arc<dyn LlmProvider>,
    analysis: CallOptions,
    snippet_chars: usize,
    search_limit: usize,
}

impl QuerySurface {
    pub fn new(db: Database, analyst: Arc<dyn LlmProvider>, config: &IndexConfig) -> Self {
        Self {
            documents: DocumentRepo::new(db.clone()),
            chunks: ChunkRepo::new(db.clone()),
            nodes: NodeRepo::new(db),
            analyst,
            analysis: CallOptions {
                timeout: config.analysis_timeout(),
                retries: config.summary_retries,
                backoff: config.summary_backoff(),
            },
            snippet_chars: config.snippet_chars.max(1),
            search_limit: config.search_limit,
        }
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>, QueryError> {
        Ok(self.documents.list()?)
    }

    pub fn document(&self, document_id: &DocumentId) -> Result<DocumentRecord, QueryError> {
        Ok(self.documents.get(document_id)?)
    }

    /// Table of contents: the root's children, or the root itself when the
    /// whole document is a single leaf.
    pub fn get_structure(&self, document_id: &DocumentId) -> Result<Vec<NodeOverview>, QueryError> {
        let doc = self.documents.get(document_id)?;
        let root_id = doc.root_id.ok_or_else(|| QueryError::NotReady {
            document_id: document_id.clone(),
            status: doc.status,
        })?;
        let root = self.nodes.get(&root_id)?;
        if root.is_leaf() {
            return Ok(vec![self.overview(&root)]);
        }
        let children = self.nodes.children(&root_id)?;
        Ok(children.iter().map(|n| self.overview(n)).collect())
    }

    /// Summaries containing `term`, best matches first.
    pub fn search(&self, document_id: &DocumentId, term: &str) -> Result<Vec<SearchHit>, QueryError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(QueryError::InvalidRequest("search term is empty".into()));
        }
        self.documents.get(document_id)?;
        let hits = self.nodes.search(document_id, term, self.search_limit)?;
        debug!(document_id = %document_id, term, hits = hits.len(), "summary search");
        Ok(hits
            .into_iter()
            .map(|m| SearchHit {
                snippet: snippet_around(&m.node.summary_text, term, self.snippet_chars),
                node_id: m.node.id,
                level: m.node.level,
                position: m.node.position,
                occurrences: m.occurrences,
            })
            .collect())
    }

    /// Ordered children of a node. Leaves have none.
    pub fn children(&self, node_id: &NodeId) -> Result<Vec<NodeOverview>, QueryError> {
        let children = self.nodes.children(node_id)?;
        Ok(children.iter().map(|n| self.overview(n)).collect())
    }

    /// Offsets and boundary metadata of a leaf. Never includes its text.
    pub fn chunk_info(&self, chunk_id: &NodeId) -> Result<ChunkInfo, QueryError> {
        Ok(self.chunks.info(chunk_id)?)
    }

    /// Ask the analysis model `query` about one chunk and return its answer.
    #[instrument(skip(self, query, cancel), fields(chunk_id = %chunk_id))]
    pub async fn analyze_chunk(
        &self,
        chunk_id: &NodeId,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<String, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::InvalidRequest("query is empty".into()));
        }
        let chunk = self.chunks.get(chunk_id)?;
        let request = CompletionRequest::new(prompts::analysis_prompt(&chunk.text, query))
            .with_system(prompts::ANALYSIS_SYSTEM);
        let answer = complete_with_policy(self.analyst.as_ref(), &request, &self.analysis, cancel).await?;
        debug!(answer_chars = answer.chars().count(), "chunk analyzed");
        Ok(answer.trim().to_string())
    }

    /// Summary nodes show their children; leaves need a question and are
    /// answered by delegation.
    pub async fn examine(
        &self,
        node_id: &NodeId,
        query: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Examination, QueryError> {
        let node = self.nodes.get(node_id)?;
        if !node.is_leaf() {
            let children = self.nodes.children(node_id)?;
            return Ok(Examination::Summary {
                node: self.overview(&node),
                summary: node.summary_text,
                children: children.iter().map(|n| self.overview(n)).collect(),
            });
        }

        let query = query.map(str::trim).filter(|q| !q.is_empty()).ok_or_else(|| {
            QueryError::InvalidRequest(format!("{node_id} is a leaf; examining it needs a query"))
        })?;
        let answer = self.analyze_chunk(node_id, query, cancel).await?;
        let chunk = self.chunks.info(node_id)?;
        Ok(Examination::Answer { chunk, answer })
    }

    fn overview(&self, node: &TreeNode) -> NodeOverview {
        NodeOverview {
            id: node.id.clone(),
            level: node.level,
            position: node.position,
            snippet: preview(&node.summary_text, self.snippet_chars),
            child_count: node.child_ids.len(),
            degraded: node.degraded,
        }
    }
}
