use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use arbor_core::ids::NodeId;
use arbor_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use crate::query::{Examination, QuerySurface};

pub struct ExamineNodeTool {
    surface: Arc<QuerySurface>,
}

impl ExamineNodeTool {
    pub fn new(surface: Arc<QuerySurface>) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl Tool for ExamineNodeTool {
    fn name(&self) -> &str {
        "examine_node"
    }

    fn description(&self) -> &str {
        "Read a summary node with its children, or ask a question about a leaf chunk. \
         Leaf text is never returned, only the answer."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["node_id"],
            "properties": {
                "node_id": {
                    "type": "string",
                    "description": "Node to examine"
                },
                "query": {
                    "type": "string",
                    "description": "Question to answer from a leaf chunk (required for leaves)"
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
        let node_id = args["node_id"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("node_id is required".into()))?;
        let query = args["query"].as_str();

        let examined = self
            .surface
            .examine(&NodeId::from_raw(node_id), query, &ctx.abort_signal)
            .await;
        match examined {
            Ok(Examination::Summary { node, summary, children }) => {
                let content = format!(
                    "[{}] level {}\n{summary}\n\nChildren:\n{}",
                    node.id,
                    node.level,
                    super::render_overviews(&children)
                );
                Ok(super::ok(&content, start))
            }
            Ok(Examination::Answer { chunk, answer }) => {
                let content = format!(
                    "[{}] chars {}..{}\n{answer}",
                    chunk.id, chunk.start_offset, chunk.end_offset
                );
                Ok(super::ok(&content, start))
            }
            Err(e) => super::from_query_error(e, start),
        }
    }
}
