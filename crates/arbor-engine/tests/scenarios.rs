//! End-to-end ingestion scenarios against an in-memory store with stub
//! decision and summary models.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use arbor_core::events::{EventSink, IndexEventKind};
use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::provider::LlmProvider;
use arbor_core::tokens::CharRatioEstimator;
use arbor_core::tree::{Chunk, DecisionSource, DocumentStatus};
use arbor_engine::{BuildReport, Indexer, QuerySurface};
use arbor_llm::{MockResponse, ScriptedProvider};
use arbor_settings::{ChunkStrategy, IndexConfig};
use arbor_store::{ChunkRepo, Database, NodeRepo};

const DOC_40: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCD";

fn small_window() -> IndexConfig {
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

fn decider(cut: usize, next: usize) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(move |_, _| {
        MockResponse::text(format!(
            r#"{{"cut_index": {cut}, "next_chunk_start_index": {next}, "reasoning": "stub"}}"#
        ))
    }))
}

fn summarizer() -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(|_, i| MockResponse::text(format!("summary {i}"))))
}

fn indexer(db: &Database, config: IndexConfig, fast: Arc<dyn LlmProvider>, accurate: Arc<dyn LlmProvider>) -> Indexer {
    Indexer::new(db.clone(), config, fast, accurate, Arc::new(CharRatioEstimator::new(1))).unwrap()
}

fn stored_chunks(db: &Database, report: &BuildReport) -> Vec<Chunk> {
    ChunkRepo::new(db.clone()).list_for_document(&report.document_id).unwrap()
}

/// Concatenate chunk texts, dropping each chunk's overlap with its
/// predecessor.
fn reconstruct(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.chars().skip(c.overlap_with_prev).collect::<String>())
        .collect()
}

/// Ids reachable from `root` by following child links.
fn reachable(nodes: &NodeRepo, root: &NodeId) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(id) = stack.pop() {
        let node = nodes.get(&id).unwrap();
        stack.extend(node.child_ids.iter().cloned());
        seen.insert(id);
    }
    seen
}

#[tokio::test]
async fn scenario_a_stub_decider_overlapping_chunks() {
    let db = Database::in_memory().unwrap();
    let idx = indexer(&db, small_window(), decider(12, 10), summarizer());
    let report = idx
        .ingest_text("forty", DOC_40, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total_chunks, 4);
    assert!(report.fallback_decisions.is_empty());

    let chunks = stored_chunks(&db, &report);
    let ranges: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start_offset, c.end_offset)).collect();
    assert_eq!(ranges, vec![(0, 12), (10, 22), (20, 32), (30, 40)]);
    let overlaps: Vec<usize> = chunks.iter().map(|c| c.overlap_with_prev).collect();
    assert_eq!(overlaps, vec![0, 2, 2, 2]);
    for pair in chunks.windows(2) {
        assert!(pair[1].start_offset <= pair[0].end_offset);
    }
    assert_eq!(reconstruct(&chunks), DOC_40);
    assert_eq!(chunks[0].boundary_rationale, "stub");
    assert_eq!(chunks[3].decision_source, DecisionSource::Final);
}

#[tokio::test]
async fn scenario_b_nine_leaves_group_three() {
    let db = Database::in_memory().unwrap();
    let config = IndexConfig {
        group_size: 3,
        ..small_window()
    };
    let idx = indexer(&db, config, decider(10, 10), summarizer());
    let report = idx
        .ingest_text("ninety", "n".repeat(90), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 9);
    assert_eq!(report.depth, 2);

    let nodes = NodeRepo::new(db.clone());
    assert_eq!(nodes.count_by_level(&report.document_id).unwrap(), vec![(0, 9), (1, 3), (2, 1)]);
    for parent in nodes.by_level(&report.document_id, 1).unwrap() {
        assert_eq!(parent.child_ids.len(), 3);
    }
    let roots = nodes.roots(&report.document_id).unwrap();
    assert_eq!(roots.len(), 1);
    let root = &roots[0];
    assert_eq!(Some(&root.id), report.root_id.as_ref());
    assert_eq!(root.level, 2);
    assert_eq!(root.child_ids.len(), 3);
    assert_eq!(reachable(&nodes, &root.id).len(), 13);
}

#[tokio::test]
async fn scenario_c_malformed_then_valid_decisions() {
    let db = Database::in_memory().unwrap();
    let events = EventSink::new(256);
    let mut rx = events.subscribe();
    let fast = Arc::new(ScriptedProvider::new(|_, i| {
        if i == 0 {
            MockResponse::text("Sure! The best place to cut is after the intro.")
        } else {
            MockResponse::text(r#"```json
{"cut_index": 12, "next_chunk_start_index": 10, "reasoning": "ok"}
```"#)
        }
    }));
    let text = "First line. Second part here. Third bit and more words at the end.";
    let idx = indexer(&db, small_window(), fast.clone(), summarizer()).with_events(events);
    let report = idx.ingest_text("c", text, &CancellationToken::new()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.fallback_decisions.len(), 1);
    assert_eq!(report.fallback_decisions[0].seq, 0);
    assert_eq!(report.fallback_decisions[0].kind, "malformed");

    let chunks = stored_chunks(&db, &report);
    assert_eq!(chunks[0].decision_source, DecisionSource::Fallback);
    assert!(chunks[0].boundary_rationale.starts_with("[fallback: malformed]"));
    assert!(chunks[1..]
        .iter()
        .all(|c| matches!(c.decision_source, DecisionSource::Model | DecisionSource::Final)));
    assert_eq!(reconstruct(&chunks), text);

    let mut saw_fallback = false;
    while let Ok(event) = rx.try_recv() {
        if event.kind == IndexEventKind::FallbackTriggered {
            assert_eq!(event.details["stage"], "segmentation");
            saw_fallback = true;
        }
    }
    assert!(saw_fallback);
}

#[tokio::test]
async fn scenario_c_retry_recovers_without_fallback() {
    let db = Database::in_memory().unwrap();
    let fast = Arc::new(ScriptedProvider::new(|_, i| {
        if i == 0 {
            MockResponse::text("{not json")
        } else {
            MockResponse::text(r#"{"cut_index": 12, "next_chunk_start_index": 10}"#)
        }
    }));
    let config = IndexConfig {
        decision_retries: 1,
        ..small_window()
    };
    let idx = indexer(&db, config, fast.clone(), summarizer());
    let report = idx.ingest_text("c2", DOC_40, &CancellationToken::new()).await.unwrap();

    assert!(report.fallback_decisions.is_empty());
    let chunks = stored_chunks(&db, &report);
    assert_eq!(chunks[0].decision_source, DecisionSource::Model);
    assert_eq!(chunks[0].end_offset, 12);
    assert_eq!(fast.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_summary_timeout_degrades_node() {
    let db = Database::in_memory().unwrap();
    let events = EventSink::new(256);
    let mut rx = events.subscribe();
    let accurate = Arc::new(ScriptedProvider::new(|req, _| {
        if req.prompt.starts_with("Summarize:") && req.prompt.contains("stuck here") {
            MockResponse::delayed(Duration::from_secs(600), MockResponse::text("too late"))
        } else {
            MockResponse::text("fine")
        }
    }));
    let config = IndexConfig {
        strategy: ChunkStrategy::Fixed,
        target_chunk_tokens: 10,
        fixed_overlap_ratio: 0.0,
        summary_timeout_ms: 50,
        summary_retries: 1,
        summary_backoff_ms: 1,
        ..IndexConfig::default()
    };
    let idx = indexer(&db, config, decider(1, 1), accurate).with_events(events);
    let report = idx
        .ingest_text("d", "first partstuck herelast piece", &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total_chunks, 3);
    assert_eq!(report.degraded_nodes.len(), 1);

    let nodes = NodeRepo::new(db.clone());
    let degraded = nodes.get(&report.degraded_nodes[0]).unwrap();
    assert!(degraded.degraded);
    assert!(degraded.is_leaf());
    assert_eq!(degraded.summary_text, "[unsummarized] stuck here");
    assert_eq!(nodes.roots(&report.document_id).unwrap().len(), 1);

    let mut failures = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == IndexEventKind::ExternalCallFailed {
            assert_eq!(event.details["stage"], "summary");
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn analyze_chunk_returns_bounded_answer() {
    let db = Database::in_memory().unwrap();
    let idx = indexer(&db, small_window(), decider(12, 10), summarizer());
    let report = idx
        .ingest_text("forty", DOC_40, &CancellationToken::new())
        .await
        .unwrap();

    let analyst = Arc::new(ScriptedProvider::new(|_, _| MockResponse::text("short answer")));
    let surface = QuerySurface::new(db.clone(), analyst, idx.config());
    for chunk in stored_chunks(&db, &report) {
        let answer = surface
            .analyze_chunk(&chunk.id, "what is here?", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer, "short answer");
        assert!(!answer.contains(&chunk.text));
    }
}

#[tokio::test]
async fn query_surface_separates_not_found_from_errors() {
    let db = Database::in_memory().unwrap();
    let idx = indexer(&db, small_window(), decider(12, 10), summarizer());
    let report = idx.ingest_text("q", DOC_40, &CancellationToken::new()).await.unwrap();
    let surface = QuerySurface::new(db.clone(), summarizer(), idx.config());

    let toc = surface.get_structure(&report.document_id).unwrap();
    assert_eq!(toc.len(), 4);
    assert!(toc.iter().all(|n| n.level == 0));

    assert!(surface.get_structure(&DocumentId::from_raw("doc_nope")).unwrap_err().is_not_found());
    assert!(surface.children(&NodeId::from_raw("node_nope")).unwrap_err().is_not_found());
    assert!(surface.chunk_info(&NodeId::from_raw("node_nope")).unwrap_err().is_not_found());

    let hits = surface.search(&report.document_id, "summary").unwrap();
    assert!(!hits.is_empty());
    assert!(hits.len() <= idx.config().search_limit);
}

#[tokio::test]
async fn cancelled_build_keeps_whole_chunks_only() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    // Cancel from inside the second decision call.
    let fast = Arc::new(ScriptedProvider::new(move |_, i| {
        if i == 1 {
            trigger.cancel();
            MockResponse::delayed(Duration::from_secs(30), MockResponse::text("{}"))
        } else {
            MockResponse::text(r#"{"cut_index": 12, "next_chunk_start_index": 10}"#)
        }
    }));
    let idx = indexer(&db, small_window(), fast, summarizer());
    let err = idx.ingest_text("cancel", DOC_40, &cancel).await.unwrap_err();
    assert!(err.is_retryable());

    let docs = arbor_store::DocumentRepo::new(db.clone()).list().unwrap();
    assert_eq!(docs[0].status, DocumentStatus::Segmenting);
    let chunks = ChunkRepo::new(db.clone()).list_for_document(&docs[0].id).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text.chars().count(), 12);
}
