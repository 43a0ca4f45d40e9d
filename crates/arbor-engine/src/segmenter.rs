//! Drives the rolling buffer and boundary decisions over a document stream,
//! emitting leaf chunks with exact char offsets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use arbor_core::events::{EventSink, IndexEventKind};
use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::tokens::TokenEstimator;
use arbor_core::tree::{Chunk, ChunkInfo, DecisionSource};
use arbor_settings::IndexConfig;
use arbor_store::{ChunkRepo, Database};

use crate::buffer::{RollingBuffer, TakeResult};
use crate::decider::BoundaryDecider;
use crate::error::EngineError;
use crate::report::{BudgetStage, BudgetWarning, FallbackRecord};
use crate::retry::persist_with_retry;
use crate::source::DocumentSource;

/// How chunk boundaries are chosen.
pub enum Strategy {
    Semantic(BoundaryDecider),
    /// Token-window cuts with `overlap_ratio` of each chunk repeated.
    Fixed { overlap_ratio: f64 },
}

/// A chunk about to be materialized. `cut` and `next` are char counts from
/// the buffer start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChunk {
    pub cut: usize,
    pub next: usize,
    pub rationale: String,
    pub source: DecisionSource,
    pub budget_exceeded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmenterState {
    Filling,
    Deciding,
    Emitting(PendingChunk),
    Done,
}

/// What segmentation produced.
#[derive(Clone, Debug, Default)]
pub struct SegmentationOutcome {
    pub chunks: Vec<ChunkInfo>,
    pub char_len: usize,
    pub decision_calls: u64,
    pub fallbacks: Vec<FallbackRecord>,
    pub budget_warnings: Vec<BudgetWarning>,
}

pub struct Segmenter {
    document_id: DocumentId,
    strategy: Strategy,
    chunks: ChunkRepo,
    events: EventSink,
    cancel: CancellationToken,
    buffer: RollingBuffer,
    state: SegmenterState,
    source_done: bool,
    window_budget: u64,
    persist_retries: u32,
    persist_backoff: Duration,
    seq: u64,
    carry_overlap: usize,
    outcome: SegmentationOutcome,
}

impl Segmenter {
    pub fn new(
        document_id: DocumentId,
        strategy: Strategy,
        estimator: Arc<dyn TokenEstimator>,
        config: &IndexConfig,
        db: Database,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let window_budget = match strategy {
            Strategy::Semantic(_) => config.planning_budget(),
            Strategy::Fixed { .. } => config.target_chunk_tokens,
        };
        Self {
            document_id,
            strategy,
            chunks: ChunkRepo::new(db),
            events,
            cancel,
            buffer: RollingBuffer::new(estimator),
            state: SegmenterState::Filling,
            source_done: false,
            window_budget,
            persist_retries: config.persist_retries,
            persist_backoff: config.persist_backoff(),
            seq: 0,
            carry_overlap: 0,
            outcome: SegmentationOutcome::default(),
        }
    }

    pub fn state(&self) -> &SegmenterState {
        &self.state
    }

    /// Chars currently held in the rolling buffer.
    pub fn buffered_chars(&self) -> usize {
        self.buffer.char_len()
    }

    /// Run to `Done`. Fails with `EmptyDocument` if the stream held no text.
    #[instrument(skip_all, fields(document_id = %self.document_id, stage = "segmentation"))]
    pub async fn run(
        mut self,
        source: &mut dyn DocumentSource,
    ) -> Result<SegmentationOutcome, EngineError> {
        while self.state != SegmenterState::Done {
            self.step(source).await?;
        }
        self.outcome.char_len = self.buffer.end_offset();
        if self.outcome.chunks.is_empty() {
            return Err(EngineError::EmptyDocument(self.document_id.to_string()));
        }
        info!(
            chunks = self.outcome.chunks.len(),
            chars = self.outcome.char_len,
            decision_calls = self.outcome.decision_calls,
            fallbacks = self.outcome.fallbacks.len(),
            "segmentation complete"
        );
        Ok(self.outcome)
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, source: &mut dyn DocumentSource) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let state = std::mem::replace(&mut self.state, SegmenterState::Done);
        self.state = match state {
            SegmenterState::Filling => self.fill(source).await?,
            SegmenterState::Deciding => self.decide().await?,
            SegmenterState::Emitting(pending) => self.emit(pending).await?,
            SegmenterState::Done => SegmenterState::Done,
        };
        Ok(())
    }

    async fn fill(&mut self, source: &mut dyn DocumentSource) -> Result<SegmenterState, EngineError> {
        let wants_more = self.buffer.is_empty() || self.buffer.tokens_used() < self.window_budget;
        if !self.source_done && wants_more {
            let piece = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                piece = source.next_piece() => piece?,
            };
            match piece {
                Some(text) => self.buffer.append(&text),
                None => self.source_done = true,
            }
            return Ok(SegmenterState::Filling);
        }
        if self.buffer.is_empty() {
            Ok(SegmenterState::Done)
        } else {
            Ok(SegmenterState::Deciding)
        }
    }

    async fn decide(&mut self) -> Result<SegmenterState, EngineError> {
        let window = self.buffer.take_up_to(self.window_budget);
        if window.budget_exceeded {
            self.flag_budget(&window);
        }

        // The rest of the document fits one window: emit it whole.
        if self.source_done && window.chars == self.buffer.char_len() {
            return Ok(SegmenterState::Emitting(PendingChunk {
                cut: window.chars,
                next: window.chars,
                rationale: "end of document".into(),
                source: DecisionSource::Final,
                budget_exceeded: window.budget_exceeded,
            }));
        }

        let pending = match &self.strategy {
            Strategy::Semantic(decider) => {
                let outcome = decider.decide(&window.text, &self.cancel).await?;
                self.outcome.decision_calls += 1;
                let mut rationale = outcome.decision.reasoning.clone();
                if let Some(rejection) = &outcome.rejection {
                    let start_offset = self.buffer.start_offset();
                    warn!(seq = self.seq, start_offset, reason = %rejection, "boundary decision fell back");
                    self.events.emit(
                        IndexEventKind::FallbackTriggered,
                        &self.document_id,
                        json!({
                            "stage": "segmentation",
                            "seq": self.seq,
                            "startOffset": start_offset,
                            "kind": rejection.kind(),
                            "reason": rejection.to_string(),
                        }),
                    );
                    if rejection.is_call_failure() {
                        self.events.emit(
                            IndexEventKind::ExternalCallFailed,
                            &self.document_id,
                            json!({
                                "stage": "boundary_decision",
                                "seq": self.seq,
                                "error": rejection.to_string(),
                            }),
                        );
                    }
                    self.outcome.fallbacks.push(FallbackRecord {
                        seq: self.seq,
                        start_offset,
                        kind: rejection.kind().to_string(),
                        reason: rejection.to_string(),
                    });
                    rationale = format!("[fallback: {}] {rationale}", rejection.kind());
                }
                PendingChunk {
                    cut: outcome.decision.cut_index,
                    next: outcome.decision.next_chunk_start_index,
                    rationale,
                    source: outcome.source,
                    budget_exceeded: window.budget_exceeded,
                }
            }
            Strategy::Fixed { overlap_ratio } => {
                let cut = window.chars;
                let overlap = ((cut as f64) * overlap_ratio).floor() as usize;
                let overlap = overlap.min(cut.saturating_sub(1));
                PendingChunk {
                    cut,
                    next: cut - overlap,
                    rationale: format!("fixed window of {} tokens", window.tokens),
                    source: DecisionSource::Fixed,
                    budget_exceeded: window.budget_exceeded,
                }
            }
        };

        if pending.cut == 0 || pending.cut > window.chars || pending.next == 0 || pending.next > pending.cut {
            return Err(EngineError::OffsetOutOfRange(format!(
                "cut {} / next {} invalid for a {}-char window",
                pending.cut, pending.next, window.chars
            )));
        }
        Ok(SegmenterState::Emitting(pending))
    }

    async fn emit(&mut self, pending: PendingChunk) -> Result<SegmenterState, EngineError> {
        let start = self.buffer.start_offset();
        let chunk = Chunk {
            id: NodeId::new(),
            document_id: self.document_id.clone(),
            seq: self.seq,
            start_offset: start,
            end_offset: start + pending.cut,
            text: self.buffer.prefix(pending.cut).to_string(),
            overlap_with_prev: self.carry_overlap,
            boundary_rationale: pending.rationale,
            decision_source: pending.source,
            budget_exceeded: pending.budget_exceeded,
        };

        persist_with_retry("chunk", self.persist_retries, self.persist_backoff, || {
            self.chunks.insert(&chunk)
        })
        .await?;

        debug!(
            seq = chunk.seq,
            start = chunk.start_offset,
            end = chunk.end_offset,
            overlap = chunk.overlap_with_prev,
            source = %chunk.decision_source,
            "chunk emitted"
        );
        self.events.emit(
            IndexEventKind::ChunkEmitted,
            &self.document_id,
            json!({
                "chunkId": chunk.id,
                "seq": chunk.seq,
                "startOffset": chunk.start_offset,
                "endOffset": chunk.end_offset,
                "overlapWithPrev": chunk.overlap_with_prev,
                "source": chunk.decision_source,
            }),
        );
        self.outcome.chunks.push(ChunkInfo::from(&chunk));

        self.carry_overlap = pending.cut - pending.next;
        self.buffer.advance(pending.next);
        self.seq += 1;

        if self.source_done && self.buffer.is_empty() {
            Ok(SegmenterState::Done)
        } else {
            Ok(SegmenterState::Filling)
        }
    }

    fn flag_budget(&mut self, window: &TakeResult) {
        let detail = format!(
            "char at offset {} alone exceeds the {}-token window ({} tokens)",
            self.buffer.start_offset(),
            self.window_budget,
            window.tokens
        );
        warn!(seq = self.seq, %detail, "budget exceeded during segmentation");
        self.events.emit(
            IndexEventKind::BudgetExceeded,
            &self.document_id,
            json!({"stage": "segmentation", "seq": self.seq, "detail": detail}),
        );
        self.outcome.budget_warnings.push(BudgetWarning {
            stage: BudgetStage::Segmentation,
            level: 0,
            position: self.seq,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::tokens::CharRatioEstimator;
    use arbor_llm::{MockProvider, MockResponse, ScriptedProvider};
    use arbor_store::DocumentRepo;

    use crate::source::TextSource;

    struct Fixture {
        db: Database,
        doc: DocumentId,
        events: EventSink,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let doc = DocumentRepo::new(db.clone()).create("t", None).unwrap().id;
        Fixture {
            db,
            doc,
            events: EventSink::new(256),
        }
    }

    fn config() -> IndexConfig {
        IndexConfig {
            target_chunk_tokens: 10,
            max_window_tokens: 20,
            planning_window_fraction: 0.6,
            chars_per_token: 1,
            fallback_overlap_chars: 2,
            max_sentence_scan_chars: 4,
            ..IndexConfig::default()
        }
    }

    fn segmenter(f: &Fixture, strategy: Strategy, config: &IndexConfig) -> Segmenter {
        Segmenter::new(
            f.doc.clone(),
            strategy,
            Arc::new(CharRatioEstimator::new(1)),
            config,
            f.db.clone(),
            f.events.clone(),
            CancellationToken::new(),
        )
    }

    fn semantic(provider: Arc<dyn arbor_core::provider::LlmProvider>, config: &IndexConfig) -> Strategy {
        Strategy::Semantic(BoundaryDecider::new(
            provider,
            Arc::new(CharRatioEstimator::new(1)),
            config,
        ))
    }

    fn assert_covers(chunks: &[ChunkInfo], len: usize) {
        assert_eq!(chunks.first().unwrap().start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, len);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset <= pair[0].end_offset, "gap between chunks");
            assert!(pair[1].start_offset > pair[0].start_offset, "no progress");
            assert_eq!(pair[1].overlap_with_prev, pair[0].end_offset - pair[1].start_offset);
        }
    }

    #[tokio::test]
    async fn short_document_skips_decision() {
        let f = fixture();
        let config = config();
        let mock = Arc::new(MockProvider::new(vec![]));
        let mut seg = segmenter(&f, semantic(mock.clone(), &config), &config);
        let mut src = TextSource::new("t", "tiny doc");

        // Fill, observe end of stream, then go straight to a final chunk.
        seg.step(&mut src).await.unwrap();
        assert_eq!(seg.state(), &SegmenterState::Filling);
        seg.step(&mut src).await.unwrap();
        assert_eq!(seg.state(), &SegmenterState::Filling);
        seg.step(&mut src).await.unwrap();
        assert_eq!(seg.state(), &SegmenterState::Deciding);
        seg.step(&mut src).await.unwrap();
        assert!(matches!(
            seg.state(),
            SegmenterState::Emitting(PendingChunk { source: DecisionSource::Final, cut: 8, .. })
        ));
        seg.step(&mut src).await.unwrap();
        assert_eq!(seg.state(), &SegmenterState::Done);

        let out = seg.run(&mut src).await.unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.decision_calls, 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn model_decisions_drive_cuts() {
        let f = fixture();
        let config = config();
        let text: String = ('a'..='z').cycle().take(40).collect();
        let provider = Arc::new(ScriptedProvider::new(|_, _| {
            MockResponse::text(r#"{"cut_index": 12, "next_chunk_start_index": 10, "reasoning": "stub"}"#)
        }));
        let seg = segmenter(&f, semantic(provider.clone(), &config), &config);
        let out = seg.run(&mut TextSource::new("t", text.clone())).await.unwrap();

        let offsets: Vec<(usize, usize)> = out.chunks.iter().map(|c| (c.start_offset, c.end_offset)).collect();
        assert_eq!(offsets, vec![(0, 12), (10, 22), (20, 32), (30, 40)]);
        assert_covers(&out.chunks, 40);
        assert_eq!(out.chunks[0].overlap_with_prev, 0);
        assert_eq!(out.chunks[1].overlap_with_prev, 2);
        assert_eq!(out.chunks[3].decision_source, DecisionSource::Final);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(out.char_len, 40);

        let stored = ChunkRepo::new(f.db.clone()).list_for_document(&f.doc).unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[1].text, &text[10..22]);
    }

    #[tokio::test]
    async fn dead_decider_still_covers_document() {
        let f = fixture();
        let config = config();
        let provider = Arc::new(ScriptedProvider::new(|_, _| {
            MockResponse::Error(arbor_core::errors::GatewayError::ProviderOverloaded)
        }));
        let mut rx = f.events.subscribe();
        let text = "One. Two three. Four five six. Seven eight nine ten. Eleven.";
        let seg = segmenter(&f, semantic(provider, &config), &config);
        let out = seg.run(&mut TextSource::new("t", text)).await.unwrap();

        assert_covers(&out.chunks, text.chars().count());
        assert!(!out.fallbacks.is_empty());
        assert!(out
            .chunks
            .iter()
            .filter(|c| c.decision_source == DecisionSource::Fallback)
            .all(|c| c.boundary_rationale.starts_with("[fallback: call_failed]")));

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&IndexEventKind::FallbackTriggered));
        assert!(kinds.contains(&IndexEventKind::ExternalCallFailed));
        assert!(kinds.contains(&IndexEventKind::ChunkEmitted));
    }

    #[tokio::test]
    async fn fixed_strategy_uses_overlap_ratio() {
        let f = fixture();
        let config = config();
        let seg = segmenter(&f, Strategy::Fixed { overlap_ratio: 0.2 }, &config);
        let text = "x".repeat(35);
        let out = seg.run(&mut TextSource::new("t", text).with_piece_chars(7)).await.unwrap();

        assert_covers(&out.chunks, 35);
        assert_eq!(out.chunks[0].end_offset, 10);
        assert_eq!(out.chunks[1].start_offset, 8);
        assert!(out.chunks.iter().all(|c| c.end_offset - c.start_offset <= 10));
        assert_eq!(out.decision_calls, 0);
    }

    #[tokio::test]
    async fn empty_document_is_structural_error() {
        let f = fixture();
        let config = config();
        let seg = segmenter(&f, Strategy::Fixed { overlap_ratio: 0.1 }, &config);
        let err = seg.run(&mut TextSource::new("t", "")).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyDocument(_)));
        assert!(err.is_structural());
    }

    /// Five tokens per char, so no char fits a small window.
    struct HeavyEstimator;

    impl TokenEstimator for HeavyEstimator {
        fn estimate(&self, text: &str) -> u64 {
            text.chars().count() as u64 * 5
        }
    }

    #[tokio::test]
    async fn budget_exceeded_chars_are_kept_and_flagged() {
        let f = fixture();
        let config = IndexConfig {
            target_chunk_tokens: 3,
            ..config()
        };
        let seg = Segmenter::new(
            f.doc.clone(),
            Strategy::Fixed { overlap_ratio: 0.0 },
            Arc::new(HeavyEstimator),
            &config,
            f.db.clone(),
            f.events.clone(),
            CancellationToken::new(),
        );
        let out = seg.run(&mut TextSource::new("t", "abc")).await.unwrap();
        assert_eq!(out.chunks.len(), 3);
        assert!(out.chunks.iter().all(|c| c.budget_exceeded));
        assert_eq!(out.budget_warnings.len(), 3);
        assert_eq!(out.budget_warnings[0].stage, BudgetStage::Segmentation);
        assert_covers(&out.chunks, 3);
    }

    #[tokio::test]
    async fn cancelled_segmentation_stops() {
        let f = fixture();
        let config = config();
        let cancel = CancellationToken::new();
        let seg = Segmenter::new(
            f.doc.clone(),
            Strategy::Fixed { overlap_ratio: 0.1 },
            Arc::new(CharRatioEstimator::new(1)),
            &config,
            f.db.clone(),
            f.events.clone(),
            cancel.clone(),
        );
        cancel.cancel();
        let err = seg.run(&mut TextSource::new("t", "some text")).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(err.is_retryable());
        assert_eq!(ChunkRepo::new(f.db.clone()).count(&f.doc).unwrap(), 0);
    }

    #[tokio::test]
    async fn buffer_stays_near_window_on_long_documents() {
        let f = fixture();
        let config = IndexConfig {
            max_window_tokens: 40,
            planning_window_fraction: 1.0,
            chars_per_token: 4,
            ..config()
        };
        let provider = Arc::new(ScriptedProvider::new(|_, _| {
            MockResponse::text(r#"{"cut_index": 7, "next_chunk_start_index": 5}"#)
        }));
        let decider = BoundaryDecider::new(provider, Arc::new(CharRatioEstimator::new(4)), &config);
        let mut seg = Segmenter::new(
            f.doc.clone(),
            Strategy::Semantic(decider),
            Arc::new(CharRatioEstimator::new(4)),
            &config,
            f.db.clone(),
            f.events.clone(),
            CancellationToken::new(),
        );
        let text = "word ".repeat(2_000);
        let mut src = TextSource::new("t", text).with_piece_chars(64);

        let mut max_chars = 0;
        while seg.state() != &SegmenterState::Done {
            seg.step(&mut src).await.unwrap();
            max_chars = max_chars.max(seg.buffered_chars());
        }
        // Under the 40-token (160-char) window, plus at most one piece.
        assert!(max_chars <= 160 + 64, "buffer grew to {max_chars} chars");
        let stored = ChunkRepo::new(f.db.clone()).count(&f.doc).unwrap();
        assert!(stored > 1_900);
    }
}
