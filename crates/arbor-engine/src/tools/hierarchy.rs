use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use arbor_core::ids::NodeId;
use arbor_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::query::QuerySurface;

pub struct InspectHierarchyTool {
    surface: Arc<QuerySurface>,
}

impl InspectHierarchyTool {
    pub fn new(surface: Arc<QuerySurface>) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl Tool for InspectHierarchyTool {
    fn name(&self) -> &str {
        "inspect_document_hierarchy"
    }

    fn description(&self) -> &str {
        "List the top-level sections of the document, or the children of one node"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "node_id": {
                    "type": "string",
                    "description": "Node to expand. Omit for the document's table of contents."
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
        let listing = match args["node_id"].as_str() {
            Some(id) if !id.trim().is_empty() => self.surface.children(&NodeId::from_raw(id.trim())),
            _ => self.surface.get_structure(&ctx.document_id),
        };
        match listing {
            Ok(nodes) => Ok(super::ok(&super::render_overviews(&nodes), start)),
            Err(e) => super::from_query_error(e, start),
        }
    }
}
