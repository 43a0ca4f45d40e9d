use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use arbor_core::tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

/// Navigation tools available to an external reasoning loop, by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions handed to the reasoning process, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Dispatch one call by tool name.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        debug!(tool = name, document_id = %ctx.document_id, "executing tool");
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::ids::DocumentId;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct DummyTool {
        name: String,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult {
                content: format!("{} on {}", self.name, ctx.document_id),
                is_error: false,
                duration: std::time::Duration::from_millis(1),
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            document_id: DocumentId::from_raw("doc_1"),
            abort_signal: CancellationToken::new(),
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("search_summaries")));

        assert!(registry.contains("search_summaries"));
        assert!(!registry.contains("examine_node"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("search_summaries").is_some());
    }

    #[test]
    fn unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("examine_node")));
        assert!(registry.unregister("examine_node"));
        assert!(!registry.contains("examine_node"));
        assert!(!registry.unregister("examine_node"));
    }

    #[test]
    fn names_and_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("search_summaries")));
        registry.register(Arc::new(DummyTool::new("examine_node")));
        registry.register(Arc::new(DummyTool::new("inspect_document_hierarchy")));

        assert_eq!(
            registry.names(),
            vec!["examine_node", "inspect_document_hierarchy", "search_summaries"]
        );
        let defs = registry.definitions();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].name, "examine_node");
    }

    #[tokio::test]
    async fn execute_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("examine_node")));
        let out = registry
            .execute("examine_node", serde_json::json!({}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.content, "examine_node on doc_1");

        let err = registry
            .execute("rm", serde_json::json!({}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "rm"));
    }
}
