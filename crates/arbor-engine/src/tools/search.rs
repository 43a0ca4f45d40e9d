use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use arbor_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::query::QuerySurface;

pub struct SearchSummariesTool {
    surface: Arc<QuerySurface>,
}

impl SearchSummariesTool {
    pub fn new(surface: Arc<QuerySurface>) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl Tool for SearchSummariesTool {
    fn name(&self) -> &str {
        "search_summaries"
    }

    fn description(&self) -> &str {
        "Find summary nodes at any level whose text contains a term (case-insensitive)"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["term"],
            "properties": {
                "term": {
                    "type": "string",
                    "description": "Text to search for"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let start = Instant::now();
        let term = args["term"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("term is required".into()))?;

        let hits = match self.surface.search(&ctx.document_id, term) {
            Ok(hits) => hits,
            Err(e) => return super::from_query_error(e, start),
        };
        if hits.is_empty() {
            return Ok(super::ok(&format!("No summaries mention \"{}\"", term.trim()), start));
        }

        let mut out = String::new();
        for hit in &hits {
            let _ = writeln!(
                out,
                "[{}] level {} #{} ({} matches)\n  {}",
                hit.node_id, hit.level, hit.position, hit.occurrences, hit.snippet
            );
        }
        Ok(super::ok(&out, start))
    }
}
