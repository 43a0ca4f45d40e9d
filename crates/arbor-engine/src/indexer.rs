//! Ingestion entry point: segment a document, build its summary tree and
//! report what happened.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use arbor_core::events::{EventSink, IndexEventKind};
use arbor_core::ids::DocumentId;
use arbor_core::provider::LlmProvider;
use arbor_core::tokens::TokenEstimator;
use arbor_core::tree::DocumentStatus;
use arbor_settings::{ChunkStrategy, IndexConfig};
use arbor_store::{Database, DocumentRepo};

use crate::decider::BoundaryDecider;
use crate::error::EngineError;
use crate::report::BuildReport;
use crate::retry::persist_with_retry;
use crate::segmenter::{Segmenter, Strategy};
use crate::source::{DocumentSource, FileSource, TextSource};
use crate::summarizer::SummaryBuilder;

/// Builds tree indexes into one store.
///
/// `fast` answers boundary decisions; `accurate` writes summaries.
pub struct Indexer {
    db: Database,
    documents: DocumentRepo,
    config: IndexConfig,
    fast: Arc<dyn LlmProvider>,
    accurate: Arc<dyn LlmProvider>,
    estimator: Arc<dyn TokenEstimator>,
    events: EventSink,
}

impl Indexer {
    pub fn new(
        db: Database,
        config: IndexConfig,
        fast: Arc<dyn LlmProvider>,
        accurate: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            documents: DocumentRepo::new(db.clone()),
            db,
            config,
            fast,
            accurate,
            estimator,
            events: EventSink::default(),
        })
    }

    /// Publish monitor events on `events` instead of a private channel.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Index one document.
    ///
    /// Structural violations end the build with a `Failed` report. Other
    /// failures are returned as errors. A cancelled build leaves the document
    /// in the status of the stage it was cut off in, `segmenting` or
    /// `summarizing`, with whatever chunks and nodes were fully written.
    #[instrument(skip_all, fields(source = source.name(), document_id = tracing::field::Empty))]
    pub async fn ingest(
        &self,
        source: &mut dyn DocumentSource,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, EngineError> {
        let started = Instant::now();
        let origin = source.origin();
        let record = self.documents.create(source.name(), origin.as_deref())?;
        let document_id = record.id;
        tracing::Span::current().record("document_id", tracing::field::display(&document_id));
        info!(strategy = ?self.config.strategy, "ingestion started");

        let mut report = BuildReport::new(document_id.clone());
        match self.build(&document_id, source, cancel, &mut report).await {
            Ok(()) => {}
            Err(e) if e.is_structural() => {
                error!(error = %e, "ingestion aborted by structural error");
                report.status = DocumentStatus::Failed;
                report.structural_errors.push(e.to_string());
                self.mark_failed(&document_id);
            }
            Err(EngineError::Cancelled) => {
                warn!(chunks = report.total_chunks, "ingestion cancelled");
                return Err(EngineError::Cancelled);
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "ingestion failed");
                self.mark_failed(&document_id);
                return Err(e);
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.events.emit(
            IndexEventKind::BuildCompleted,
            &document_id,
            json!({
                "status": report.status,
                "totalChunks": report.total_chunks,
                "depth": report.depth,
                "rootId": report.root_id,
                "fallbacks": report.fallback_decisions.len(),
                "degraded": report.degraded_nodes.len(),
                "elapsedMs": report.elapsed_ms,
            }),
        );
        info!(
            status = %report.status,
            chunks = report.total_chunks,
            depth = report.depth,
            elapsed_ms = report.elapsed_ms,
            "ingestion finished"
        );
        Ok(report)
    }

    pub async fn ingest_text(
        &self,
        name: &str,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, EngineError> {
        let mut source = TextSource::new(name, text).with_piece_chars(self.config.source_piece_chars);
        self.ingest(&mut source, cancel).await
    }

    pub async fn ingest_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, EngineError> {
        let mut source = FileSource::open(path).await?;
        self.ingest(&mut source, cancel).await
    }

    /// Remove a document with all of its chunks and nodes.
    pub fn drop_document(&self, document_id: &DocumentId) -> Result<(), EngineError> {
        self.documents.delete(document_id)?;
        info!(document_id = %document_id, "document dropped");
        Ok(())
    }

    async fn build(
        &self,
        document_id: &DocumentId,
        source: &mut dyn DocumentSource,
        cancel: &CancellationToken,
        report: &mut BuildReport,
    ) -> Result<(), EngineError> {
        let strategy = match self.config.strategy {
            ChunkStrategy::Semantic => Strategy::Semantic(BoundaryDecider::new(
                Arc::clone(&self.fast),
                Arc::clone(&self.estimator),
                &self.config,
            )),
            ChunkStrategy::Fixed => Strategy::Fixed {
                overlap_ratio: self.config.fixed_overlap_ratio,
            },
        };
        let segmenter = Segmenter::new(
            document_id.clone(),
            strategy,
            Arc::clone(&self.estimator),
            &self.config,
            self.db.clone(),
            self.events.clone(),
            cancel.clone(),
        );
        let segmented = segmenter.run(source).await?;
        report.char_len = segmented.char_len;
        report.total_chunks = segmented.chunks.len() as u64;
        report.fallback_decisions = segmented.fallbacks;
        report.budget_warnings = segmented.budget_warnings;

        self.persist("document length", || {
            self.documents.set_char_len(document_id, segmented.char_len)
        })
        .await?;
        self.persist("document status", || {
            self.documents.set_status(document_id, DocumentStatus::Summarizing)
        })
        .await?;
        report.status = DocumentStatus::Summarizing;

        let builder = SummaryBuilder::new(
            Arc::clone(&self.accurate),
            Arc::clone(&self.estimator),
            &self.config,
            self.db.clone(),
            self.events.clone(),
            cancel.clone(),
        );
        let tree = builder.build(document_id, &segmented.chunks).await?;

        self.persist("document root", || self.documents.mark_ready(document_id, &tree.root.id))
            .await?;
        report.status = DocumentStatus::Ready;
        report.root_id = Some(tree.root.id);
        report.depth = tree.depth;
        report.total_levels = tree.depth + 1;
        report.degraded_nodes = tree.degraded_nodes;
        report.budget_warnings.extend(tree.budget_warnings);
        Ok(())
    }

    async fn persist<T>(
        &self,
        what: &str,
        write: impl FnMut() -> Result<T, arbor_store::StoreError>,
    ) -> Result<T, EngineError> {
        Ok(persist_with_retry(what, self.config.persist_retries, self.config.persist_backoff(), write).await?)
    }

    fn mark_failed(&self, document_id: &DocumentId) {
        if let Err(e) = self.documents.set_status(document_id, DocumentStatus::Failed) {
            warn!(error = %e, "could not mark document failed");
        }
    }
}
