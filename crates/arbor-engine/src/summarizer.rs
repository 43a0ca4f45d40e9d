//! Bottom-up construction of the summary tree over persisted leaf chunks.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt, TryStreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use arbor_core::errors::GatewayError;
use arbor_core::events::{EventSink, IndexEventKind};
use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::provider::{CallOptions, CompletionRequest, LlmProvider};
use arbor_core::tokens::TokenEstimator;
use arbor_core::tree::{ChunkInfo, TreeNode};
use arbor_settings::IndexConfig;
use arbor_store::{ChunkRepo, Database, NodeRepo};

use crate::error::EngineError;
use crate::prompts;
use crate::report::{BudgetStage, BudgetWarning};
use crate::retry::{complete_with_policy, persist_with_retry};
use crate::truncate::truncate_chars;

pub const DEGRADED_PREFIX: &str = "[unsummarized] ";

const GROUP_SEPARATOR: &str = "\n\n";

/// The finished tree.
#[derive(Clone, Debug)]
pub struct SummaryOutcome {
    pub root: TreeNode,
    /// Levels above the leaves.
    pub depth: u32,
    pub degraded_nodes: Vec<NodeId>,
    pub budget_warnings: Vec<BudgetWarning>,
}

/// What a finished summary call leaves behind between levels.
struct Placed {
    id: NodeId,
    degraded: bool,
    warning: Option<BudgetWarning>,
}

/// Running totals for the level being built. Node bodies stay in the store.
#[derive(Default)]
struct LevelTally {
    nodes: u64,
    last: Option<NodeId>,
    degraded: Vec<NodeId>,
    warnings: Vec<BudgetWarning>,
}

impl LevelTally {
    fn absorb(&mut self, placed: Placed) {
        self.nodes += 1;
        if placed.degraded {
            self.degraded.push(placed.id.clone());
        }
        self.warnings.extend(placed.warning);
        self.last = Some(placed.id);
    }
}

pub struct SummaryBuilder {
    provider: Arc<dyn LlmProvider>,
    estimator: Arc<dyn TokenEstimator>,
    chunks: ChunkRepo,
    nodes: NodeRepo,
    events: EventSink,
    cancel: CancellationToken,
    options: CallOptions,
    group_size: usize,
    concurrency: usize,
    target_chunk_tokens: u64,
    degraded_excerpt_chars: usize,
    persist_retries: u32,
    persist_backoff: Duration,
}

impl SummaryBuilder {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
        config: &IndexConfig,
        db: Database,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            estimator,
            chunks: ChunkRepo::new(db.clone()),
            nodes: NodeRepo::new(db),
            events,
            cancel,
            options: CallOptions {
                timeout: config.summary_timeout(),
                retries: config.summary_retries,
                backoff: config.summary_backoff(),
            },
            group_size: config.group_size,
            concurrency: config.summary_concurrency.max(1),
            target_chunk_tokens: config.target_chunk_tokens,
            degraded_excerpt_chars: config.degraded_excerpt_chars,
            persist_retries: config.persist_retries,
            persist_backoff: config.persist_backoff(),
        }
    }

    /// Summarize every leaf, then fold levels until one root remains.
    /// Each level completes before the next starts. A level is read back
    /// from the store one group at a time, so at most `summaryConcurrency`
    /// groups are held in memory.
    #[instrument(skip_all, fields(document_id = %document_id, stage = "summaries", leaves = leaves.len()))]
    pub async fn build(
        &self,
        document_id: &DocumentId,
        leaves: &[ChunkInfo],
    ) -> Result<SummaryOutcome, EngineError> {
        if leaves.is_empty() {
            return Err(EngineError::EmptyDocument(document_id.to_string()));
        }
        if self.group_size < 2 && leaves.len() > 1 {
            return Err(EngineError::InvalidConfig(arbor_settings::SettingsError::InvalidValue(
                format!("groupSize must be >= 2, got {}", self.group_size),
            )));
        }

        let mut tally = LevelTally::default();
        {
            let mut placed = pin!(stream::iter(leaves)
                .map(|info| self.summarize_leaf(document_id, info))
                .buffered(self.concurrency));
            while let Some(leaf) = placed.try_next().await? {
                tally.absorb(leaf);
            }
        }
        self.level_completed(document_id, 0, tally.nodes);

        let mut level = 0;
        let mut below = tally.nodes;
        let mut root = tally.last.take();
        while below > 1 {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            level += 1;
            let group_size = self.group_size as u64;
            let groups = below.div_ceil(group_size);
            let mut this_level = LevelTally::default();
            {
                let mut placed = pin!(stream::iter(0..groups)
                    .map(|position| self.summarize_group(document_id, level, position))
                    .buffered(self.concurrency));
                while let Some(parent) = placed.try_next().await? {
                    this_level.absorb(parent);
                }
            }
            self.level_completed(document_id, level, this_level.nodes);
            tally.degraded.append(&mut this_level.degraded);
            tally.warnings.append(&mut this_level.warnings);
            below = this_level.nodes;
            root = this_level.last;
        }

        let root_id = root.ok_or_else(|| EngineError::Internal("tree build produced no root".into()))?;
        let root = self.nodes.get(&root_id)?;
        info!(
            root = %root.id,
            depth = level,
            degraded = tally.degraded.len(),
            "summary tree complete"
        );
        Ok(SummaryOutcome {
            root,
            depth: level,
            degraded_nodes: tally.degraded,
            budget_warnings: tally.warnings,
        })
    }

    async fn summarize_leaf(
        &self,
        document_id: &DocumentId,
        info: &ChunkInfo,
    ) -> Result<Placed, EngineError> {
        let chunk = self.chunks.get(&info.id)?;
        let prompt = prompts::leaf_summary_prompt(&chunk.text);
        let (summary, degraded) = self
            .summarize(document_id, 0, chunk.seq, prompt, &chunk.text)
            .await?;
        let node = persist_with_retry("leaf node", self.persist_retries, self.persist_backoff, || {
            self.nodes
                .insert_leaf(document_id, &chunk.id, chunk.seq, &summary, degraded)
        })
        .await?;
        debug!(seq = chunk.seq, degraded, "leaf summarized");
        Ok(Placed {
            id: node.id,
            degraded,
            warning: None,
        })
    }

    /// Summarize the `position`-th run of `group_size` nodes one level down.
    async fn summarize_group(
        &self,
        document_id: &DocumentId,
        level: u32,
        position: u64,
    ) -> Result<Placed, EngineError> {
        let group = self.nodes.level_page(
            document_id,
            level - 1,
            position * self.group_size as u64,
            self.group_size,
        )?;
        if group.is_empty() {
            return Err(EngineError::Internal(format!(
                "level {} has no nodes at group {position}",
                level - 1
            )));
        }
        let joined = group
            .iter()
            .map(|n| n.summary_text.as_str())
            .collect::<Vec<_>>()
            .join(GROUP_SEPARATOR);

        let total_chars = joined.chars().count();
        let fit = self.estimator.max_prefix_chars(&joined, self.target_chunk_tokens);
        let mut warning = None;
        let input = if fit < total_chars {
            let detail = format!(
                "group of {} summaries clipped from {total_chars} to {fit} chars to fit {} tokens",
                group.len(),
                self.target_chunk_tokens
            );
            warn!(level, position, %detail, "group summary input over budget");
            self.events.emit(
                IndexEventKind::BudgetExceeded,
                document_id,
                json!({"stage": "group_summary", "level": level, "position": position, "detail": detail}),
            );
            warning = Some(BudgetWarning {
                stage: BudgetStage::GroupSummary,
                level,
                position,
                detail,
            });
            truncate_chars(&joined, fit)
        } else {
            joined.as_str()
        };

        let prompt = prompts::group_summary_prompt(input);
        let (summary, degraded) = self
            .summarize(document_id, level, position, prompt, input)
            .await?;
        let child_ids: Vec<NodeId> = group.into_iter().map(|n| n.id).collect();
        let node = persist_with_retry("parent node", self.persist_retries, self.persist_backoff, || {
            self.nodes
                .insert_parent(document_id, level, position, &summary, degraded, &child_ids)
        })
        .await?;
        debug!(level, position, children = child_ids.len(), degraded, "group summarized");
        Ok(Placed {
            id: node.id,
            degraded,
            warning,
        })
    }

    /// One summarization call. Any failure except cancellation yields a
    /// degraded excerpt of `source_text` instead of an error.
    async fn summarize(
        &self,
        document_id: &DocumentId,
        level: u32,
        position: u64,
        prompt: String,
        source_text: &str,
    ) -> Result<(String, bool), EngineError> {
        let request = CompletionRequest::new(prompt)
            .with_system(prompts::SUMMARY_SYSTEM)
            .with_max_tokens(u32::try_from(self.target_chunk_tokens).unwrap_or(u32::MAX));

        let reason = match complete_with_policy(self.provider.as_ref(), &request, &self.options, &self.cancel).await {
            Ok(text) if !text.trim().is_empty() => return Ok((text.trim().to_string(), false)),
            Ok(_) => "empty summary".to_string(),
            Err(GatewayError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                self.events.emit(
                    IndexEventKind::ExternalCallFailed,
                    document_id,
                    json!({
                        "stage": "summary",
                        "level": level,
                        "position": position,
                        "error": e.to_string(),
                        "errorKind": e.error_kind(),
                    }),
                );
                e.to_string()
            }
        };

        warn!(level, position, %reason, "summary degraded");
        self.events.emit(
            IndexEventKind::FallbackTriggered,
            document_id,
            json!({"stage": "summary", "level": level, "position": position, "reason": reason}),
        );
        Ok((degraded_summary(source_text, self.degraded_excerpt_chars), true))
    }

    fn level_completed(&self, document_id: &DocumentId, level: u32, nodes: u64) {
        info!(level, nodes, "level complete");
        self.events.emit(
            IndexEventKind::LevelCompleted,
            document_id,
            json!({"level": level, "nodes": nodes}),
        );
    }
}

/// Marked excerpt standing in for a summary that could not be produced.
pub fn degraded_summary(source_text: &str, excerpt_chars: usize) -> String {
    format!("{DEGRADED_PREFIX}{}", truncate_chars(source_text.trim(), excerpt_chars))
}
