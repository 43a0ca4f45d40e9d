pub mod examine;
pub mod hierarchy;
pub mod search;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use arbor_core::tools::{ToolError, ToolResult};

use crate::query::{NodeOverview, QueryError, QuerySurface};
use crate::registry::ToolRegistry;
use crate::truncate::{truncate_output, MAX_TOOL_OUTPUT_CHARS};

/// Registry with the three navigation tools bound to one query surface.
pub fn create_navigation_registry(surface: Arc<QuerySurface>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(hierarchy::InspectHierarchyTool::new(Arc::clone(&surface))));
    registry.register(Arc::new(examine::ExamineNodeTool::new(Arc::clone(&surface))));
    registry.register(Arc::new(search::SearchSummariesTool::new(surface)));
    registry
}

pub(crate) fn ok(content: &str, start: Instant) -> ToolResult {
    ToolResult {
        content: truncate_output(content, MAX_TOOL_OUTPUT_CHARS),
        is_error: false,
        duration: start.elapsed(),
    }
}

/// Caller mistakes come back as an error result the reasoning process can
/// read; infrastructure failures are tool errors.
pub(crate) fn from_query_error(e: QueryError, start: Instant) -> Result<ToolResult, ToolError> {
    match e {
        QueryError::NotFound(_) | QueryError::InvalidRequest(_) | QueryError::NotReady { .. } => {
            Ok(ToolResult {
                content: e.to_string(),
                is_error: true,
                duration: start.elapsed(),
            })
        }
        QueryError::Cancelled => Err(ToolError::Cancelled),
        other => Err(ToolError::ExecutionFailed(other.to_string())),
    }
}

pub(crate) fn render_overviews(nodes: &[NodeOverview]) -> String {
    if nodes.is_empty() {
        return "(no nodes)".to_string();
    }
    let mut out = String::new();
    for n in nodes {
        let _ = write!(out, "[{}] level {} #{}", n.id, n.level, n.position);
        if n.child_count > 0 {
            let _ = write!(out, " ({} children)", n.child_count);
        }
        if n.degraded {
            out.push_str(" [degraded]");
        }
        let _ = writeln!(out, "\n  {}", n.snippet);
    }
    out
}
