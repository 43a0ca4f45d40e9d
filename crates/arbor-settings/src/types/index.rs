use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// How leaf boundaries are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Boundary decisions come from the fast model, with deterministic fallback.
    #[default]
    Semantic,
    /// Token-window cuts with a fixed overlap ratio. No model calls.
    Fixed,
}

/// Tree build and query configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexConfig {
    /// Size a leaf chunk aims for. Also the budget for each group
    /// concatenation handed to the summarizer.
    pub target_chunk_tokens: u64,
    /// Input budget of a boundary-decision call.
    pub max_window_tokens: u64,
    /// Fraction of `max_window_tokens` presented per decision call.
    pub planning_window_fraction: f64,
    /// Fan-in per level transition.
    pub group_size: usize,
    pub strategy: ChunkStrategy,
    /// Overlap as a fraction of the chunk for the fixed strategy.
    pub fixed_overlap_ratio: f64,
    /// Chars per token for the default estimator.
    pub chars_per_token: u32,
    /// Upper bound on fallback overlap, in chars.
    pub fallback_overlap_chars: usize,
    /// How far back a fallback cut may move to land on a boundary, in chars.
    pub max_sentence_scan_chars: usize,
    pub decision_timeout_ms: u64,
    pub decision_retries: u32,
    pub summary_timeout_ms: u64,
    pub summary_retries: u32,
    pub summary_backoff_ms: u64,
    pub summary_concurrency: usize,
    pub analysis_timeout_ms: u64,
    pub persist_retries: u32,
    pub persist_backoff_ms: u64,
    pub snippet_chars: usize,
    pub search_limit: usize,
    pub degraded_excerpt_chars: usize,
    /// How many chars a document source yields per read.
    pub source_piece_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            target_chunk_tokens: 1_000,
            max_window_tokens: 8_000,
            planning_window_fraction: 0.7,
            group_size: 5,
            strategy: ChunkStrategy::Semantic,
            fixed_overlap_ratio: 0.1,
            chars_per_token: 4,
            fallback_overlap_chars: 200,
            max_sentence_scan_chars: 400,
            decision_timeout_ms: 20_000,
            decision_retries: 0,
            summary_timeout_ms: 60_000,
            summary_retries: 2,
            summary_backoff_ms: 500,
            summary_concurrency: 4,
            analysis_timeout_ms: 120_000,
            persist_retries: 3,
            persist_backoff_ms: 50,
            snippet_chars: 200,
            search_limit: 10,
            degraded_excerpt_chars: 400,
            source_piece_chars: 16 * 1024,
        }
    }
}

impl IndexConfig {
    /// Tokens of buffered text presented to one decision call.
    pub fn planning_budget(&self) -> u64 {
        (self.max_window_tokens as f64 * self.planning_window_fraction).floor() as u64
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }

    pub fn summary_backoff(&self) -> Duration {
        Duration::from_millis(self.summary_backoff_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    /// Reject configurations that can never build a valid tree.
    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_tokens == 0 {
            return Err(invalid("targetChunkTokens must be > 0"));
        }
        if self.max_window_tokens == 0 {
            return Err(invalid("maxWindowTokens must be > 0"));
        }
        if !(self.planning_window_fraction > 0.0 && self.planning_window_fraction <= 1.0) {
            return Err(invalid(format!(
                "planningWindowFraction must be in (0, 1], got {}",
                self.planning_window_fraction
            )));
        }
        if self.planning_budget() == 0 {
            return Err(invalid("planning window rounds down to zero tokens"));
        }
        if self.group_size < 2 {
            return Err(invalid(format!(
                "groupSize must be >= 2, got {}",
                self.group_size
            )));
        }
        if !(0.0..1.0).contains(&self.fixed_overlap_ratio) {
            return Err(invalid("fixedOverlapRatio must be in [0, 1)"));
        }
        if self.summary_concurrency == 0 {
            return Err(invalid("summaryConcurrency must be > 0"));
        }
        if self.source_piece_chars == 0 {
            return Err(invalid("sourcePieceChars must be > 0"));
        }
        if self.chars_per_token == 0 {
            return Err(invalid("charsPerToken must be > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(msg.into())
}
