use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use arbor_core::ids::{DocumentId, NodeId};
use arbor_core::provider::LlmProvider;
use arbor_core::tokens::TokenEstimator;
use arbor_engine::{Indexer, QuerySurface};
use arbor_llm::{OpenAiCompatProvider, OpenAiConfig, RotatingProvider};
use arbor_settings::{ArborSettings, ChunkStrategy, ModelEndpoint, ProviderSettings};
use arbor_store::{Database, DocumentRepo};
use arbor_telemetry::{init_telemetry, parse_level, LogFilter, SqliteLogSink, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "arbor", version, about = "Build and navigate hierarchical summary trees over long documents")]
struct Cli {
    /// Tree store path; overrides `storage.dbPath`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Segment a file and build its summary tree.
    Ingest {
        path: PathBuf,
        /// Fixed-size windows instead of model-chosen boundaries.
        #[arg(long)]
        fixed: bool,
        /// Print monitor events to stderr as they happen.
        #[arg(long)]
        events: bool,
    },
    /// List indexed documents.
    Documents,
    /// Top-level sections of a document.
    Structure { document_id: String },
    /// Summary nodes mentioning a term.
    Search { document_id: String, term: String },
    /// Direct children of a node.
    Children { node_id: String },
    /// Show a summary node, or ask a question about a leaf.
    Examine {
        node_id: String,
        #[arg(long, short)]
        query: Option<String>,
    },
    /// Ask a question about one chunk.
    Analyze { chunk_id: String, query: String },
    /// Remove a document and its tree.
    Drop { document_id: String },
    /// Warnings and errors persisted while building a document.
    Logs {
        document_id: String,
        /// Only records from one stage: `segmentation` or `summaries`.
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        errors_only: bool,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = arbor_settings::load_settings().context("loading settings")?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.telemetry.log_level),
        log_to_sqlite: settings.telemetry.log_to_sqlite,
        log_db_path: arbor_settings::resolve_path(&settings.telemetry.log_db_path),
        ..TelemetryConfig::default()
    });

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| arbor_settings::resolve_path(&settings.storage.db_path));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    tracing::debug!(path = %db_path.display(), "tree store opened");

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    run(cli.command, settings, db, &telemetry, cancel).await
}

async fn run(
    command: Command,
    settings: ArborSettings,
    db: Database,
    telemetry: &TelemetryGuard,
    cancel: CancellationToken,
) -> Result<()> {
    match command {
        Command::Ingest { path, fixed, events } => {
            let mut config = settings.index.clone();
            if fixed {
                config.strategy = ChunkStrategy::Fixed;
            }
            let indexer = Indexer::new(
                db,
                config.clone(),
                fast_provider(&settings.providers)?,
                accurate_provider(&settings.providers)?,
                estimator(config.chars_per_token)?,
            )?;
            if events {
                let mut rx = indexer.events().subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{line}");
                        }
                    }
                });
            }
            let report = indexer.ingest_file(&path, &cancel).await?;
            print_json(&report)
        }
        Command::Documents => print_json(&surface(&settings, db)?.list_documents()?),
        Command::Structure { document_id } => {
            print_json(&surface(&settings, db)?.get_structure(&DocumentId::from_raw(document_id))?)
        }
        Command::Search { document_id, term } => {
            print_json(&surface(&settings, db)?.search(&DocumentId::from_raw(document_id), &term)?)
        }
        Command::Children { node_id } => {
            print_json(&surface(&settings, db)?.children(&NodeId::from_raw(node_id))?)
        }
        Command::Examine { node_id, query } => {
            let surface = surface(&settings, db)?;
            let examination = surface
                .examine(&NodeId::from_raw(node_id), query.as_deref(), &cancel)
                .await?;
            print_json(&examination)
        }
        Command::Analyze { chunk_id, query } => {
            let surface = surface(&settings, db)?;
            let answer = surface
                .analyze_chunk(&NodeId::from_raw(chunk_id), &query, &cancel)
                .await?;
            println!("{answer}");
            Ok(())
        }
        Command::Drop { document_id } => {
            let id = DocumentId::from_raw(document_id);
            DocumentRepo::new(db).delete(&id)?;
            println!("dropped {id}");
            Ok(())
        }
        Command::Logs {
            document_id,
            stage,
            errors_only,
            limit,
        } => {
            let sink = log_sink(&settings, telemetry)?;
            let records = sink.read(&LogFilter {
                stage,
                errors_only,
                limit,
                ..LogFilter::for_document(document_id)
            })?;
            print_json(&records)
        }
    }
}

/// The sink this process writes to, or the configured log database when
/// persistence is switched off for this run.
fn log_sink(settings: &ArborSettings, telemetry: &TelemetryGuard) -> Result<Arc<SqliteLogSink>> {
    if let Some(sink) = telemetry.logs() {
        return Ok(sink);
    }
    let path = arbor_settings::resolve_path(&settings.telemetry.log_db_path);
    if !path.exists() {
        anyhow::bail!(
            "no log database at {}; enable telemetry.logToSqlite to record build warnings",
            path.display()
        );
    }
    let sink = SqliteLogSink::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(sink))
}

fn surface(settings: &ArborSettings, db: Database) -> Result<QuerySurface> {
    Ok(QuerySurface::new(db, accurate_provider(&settings.providers)?, &settings.index))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn openai(endpoint: &ModelEndpoint, model: &str) -> Result<OpenAiCompatProvider> {
    let mut config = OpenAiConfig::new(&endpoint.base_url, model);
    config.temperature = endpoint.temperature;
    config.max_tokens = endpoint.max_tokens;
    config.context_window = endpoint.context_window;
    config.request_timeout = Duration::from_millis(endpoint.request_timeout_ms);
    if let Ok(key) = std::env::var(&endpoint.api_key_env) {
        config = config.with_api_key(key);
    }
    OpenAiCompatProvider::new(config).with_context(|| format!("building provider for {model}"))
}

/// One HTTP attempt per call. Retries, timeouts and backoff are applied by
/// the engine's call policy.
fn endpoint_provider(endpoint: &ModelEndpoint, model: &str) -> Result<Arc<dyn LlmProvider>> {
    Ok(Arc::new(openai(endpoint, model)?))
}

fn fast_provider(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    if settings.rotation.is_empty() {
        return endpoint_provider(&settings.fast, &settings.fast.model);
    }
    let members = std::iter::once(&settings.fast.model)
        .chain(settings.rotation.iter())
        .map(|model| endpoint_provider(&settings.fast, model))
        .collect::<Result<Vec<_>>>()?;
    let rotating = RotatingProvider::new(members).context("empty model rotation")?;
    Ok(Arc::new(rotating))
}

fn accurate_provider(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    endpoint_provider(&settings.accurate, &settings.accurate.model)
}

#[cfg(not(feature = "tiktoken"))]
fn estimator(chars_per_token: u32) -> Result<Arc<dyn TokenEstimator>> {
    Ok(Arc::new(arbor_core::tokens::CharRatioEstimator::new(chars_per_token)))
}

#[cfg(feature = "tiktoken")]
fn estimator(_chars_per_token: u32) -> Result<Arc<dyn TokenEstimator>> {
    let bpe = arbor_core::tokens::TiktokenEstimator::cl100k().map_err(anyhow::Error::msg)?;
    Ok(Arc::new(bpe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::provider::{CallOptions, CompletionRequest};
    use arbor_engine::retry::complete_with_policy;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// First request fails with 503, every later one answers "recovered".
    async fn flaky_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "recovered"}}]
            })))
            .mount(&server)
            .await;
        server
    }

    fn settings_for(server: &MockServer) -> ProviderSettings {
        let endpoint = ModelEndpoint {
            base_url: format!("{}/v1", server.uri()),
            model: "test-model".into(),
            api_key_env: "ARBOR_TEST_UNSET_KEY".into(),
            ..ModelEndpoint::default()
        };
        ProviderSettings {
            fast: endpoint.clone(),
            accurate: endpoint,
            ..ProviderSettings::default()
        }
    }

    fn options(retries: u32) -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(5),
            retries,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn zero_retries_means_one_request() {
        let server = flaky_server().await;
        let provider = accurate_provider(&settings_for(&server)).unwrap();
        let cancel = CancellationToken::new();

        let err = complete_with_policy(provider.as_ref(), &CompletionRequest::new("hi"), &options(0), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn call_policy_owns_the_retry() {
        let server = flaky_server().await;
        let provider = fast_provider(&settings_for(&server)).unwrap();
        let cancel = CancellationToken::new();

        let text = complete_with_policy(provider.as_ref(), &CompletionRequest::new("hi"), &options(1), &cancel)
            .await
            .unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn logs_need_a_database_when_persistence_is_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ArborSettings::default();
        settings.telemetry.log_db_path = dir.path().join("missing.db").display().to_string();
        let guard = init_telemetry(TelemetryConfig::default());
        let err = log_sink(&settings, &guard).unwrap_err();
        assert!(err.to_string().contains("logToSqlite"));
    }
}
