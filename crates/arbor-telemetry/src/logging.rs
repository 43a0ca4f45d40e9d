//! Warn+ log persistence keyed by what an index build was doing: the
//! document, the build stage, the chunk sequence number and the tree level.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One persisted warning or error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub severity: String,
    pub target: String,
    pub message: String,
    pub document_id: Option<String>,
    pub stage: Option<String>,
    pub seq: Option<u64>,
    pub tree_level: Option<u32>,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
}

/// Which records to read back.
#[derive(Clone, Debug)]
pub struct LogFilter {
    pub document_id: Option<String>,
    pub stage: Option<String>,
    pub errors_only: bool,
    pub limit: u32,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            document_id: None,
            stage: None,
            errors_only: false,
            limit: 100,
        }
    }
}

impl LogFilter {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Self::default()
        }
    }
}

/// Build-correlation fields, taken from the event first and then from the
/// enclosing spans, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Correlation {
    document_id: Option<String>,
    stage: Option<String>,
    seq: Option<u64>,
    tree_level: Option<u32>,
}

impl Correlation {
    fn fill_from(&mut self, outer: &Correlation) {
        if self.document_id.is_none() {
            self.document_id.clone_from(&outer.document_id);
        }
        if self.stage.is_none() {
            self.stage.clone_from(&outer.stage);
        }
        self.seq = self.seq.or(outer.seq);
        self.tree_level = self.tree_level.or(outer.tree_level);
    }

    fn is_empty(&self) -> bool {
        *self == Correlation::default()
    }
}

#[derive(Debug)]
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::with_schema(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS build_log (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 severity TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 document_id TEXT,
                 stage TEXT,
                 seq INTEGER,
                 tree_level INTEGER,
                 fields TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_build_log_document ON build_log(document_id, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, severity: &str, target: &str, message: &str, at: &Correlation, fields: Option<String>) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO build_log (timestamp, severity, target, message, document_id, stage, seq, tree_level, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Utc::now().to_rfc3339(),
                severity,
                target,
                message,
                at.document_id,
                at.stage,
                at.seq.map(|s| s as i64),
                at.tree_level,
                fields,
            ],
        );
    }

    /// The newest `filter.limit` matching records, oldest first.
    pub fn read(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, severity, target, message, document_id, stage, seq, tree_level, fields
             FROM build_log
             WHERE (?1 IS NULL OR document_id = ?1)
               AND (?2 IS NULL OR stage = ?2)
               AND (?3 = 0 OR severity = 'ERROR')
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![filter.document_id, filter.stage, filter.errors_only, filter.limit],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    severity: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    document_id: row.get(5)?,
                    stage: row.get(6)?,
                    seq: row.get::<_, Option<i64>>(7)?.map(|s| s as u64),
                    tree_level: row.get(8)?,
                    fields: row.get(9)?,
                })
            },
        )?;
        let mut records = rows.collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// Timestamp of the latest error recorded for a document.
    pub fn last_error_at(&self, document_id: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT timestamp FROM build_log WHERE document_id = ?1 AND severity = 'ERROR'
             ORDER BY id DESC LIMIT 1",
            params![document_id],
            |row| row.get(0),
        )
        .optional()
    }
}

/// tracing layer persisting WARN and ERROR events with their build
/// correlation.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldCapture {
    message: Option<String>,
    at: Correlation,
    rest: serde_json::Map<String, serde_json::Value>,
}

impl FieldCapture {
    fn text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "document_id" => self.at.document_id = Some(value),
            "stage" => self.at.stage = Some(value),
            _ => {
                self.rest.insert(name.to_string(), value.into());
            }
        }
    }

    fn number(&mut self, name: &str, value: u64) {
        match name {
            "seq" => self.at.seq = Some(value),
            "level" => self.at.tree_level = u32::try_from(value).ok(),
            _ => {
                self.rest.insert(name.to_string(), value.into());
            }
        }
    }
}

impl Visit for FieldCapture {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), format!("{value:?}").trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.number(field.name(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        match u64::try_from(value) {
            Ok(v) => self.number(field.name(), v),
            Err(_) => {
                self.rest.insert(field.name().to_string(), value.into());
            }
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.rest.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut capture = FieldCapture::default();
        attrs.record(&mut capture);
        if capture.at.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(capture.at);
        }
    }

    /// Picks up fields recorded after span creation, such as a document id
    /// only known once the document row exists.
    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut capture = FieldCapture::default();
        values.record(&mut capture);
        if capture.at.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Correlation>() {
            Some(existing) => {
                let mut merged = capture.at;
                merged.fill_from(existing);
                *existing = merged;
            }
            None => extensions.insert(capture.at),
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let severity = *event.metadata().level();
        if severity > tracing::Level::WARN {
            return;
        }
        let mut capture = FieldCapture::default();
        event.record(&mut capture);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    capture.at.fill_from(outer);
                }
            }
        }
        let fields = (!capture.rest.is_empty())
            .then(|| serde_json::to_string(&capture.rest).unwrap_or_default());
        self.sink.write(
            &severity.to_string(),
            event.metadata().target(),
            capture.message.as_deref().unwrap_or_default(),
            &capture.at,
            fields,
        );
    }
}
