//! MCP JSON-RPC protocol bridge.
//!
//! Exposes the [`ToolRegistry`] as MCP tools (`tools/list`, `tools/call`)
//! behind the Streamable HTTP endpoint mounted at `/mcp` by
//! [`crate::server`]. Calls go through [`ToolRegistry::execute`], so MCP
//! clients get the same argument validation and failure containment as
//! HTTP callers.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::Value;

use crate::error::Error;
use crate::traits::{ToolContext, ToolRegistry};

/// Each MCP session receives a clone; the registry and context are shared.
#[derive(Clone)]
pub struct McpBridge {
    tools: Arc<ToolRegistry>,
    context: Arc<ToolContext>,
}

impl McpBridge {
    pub fn new(tools: Arc<ToolRegistry>, context: Arc<ToolContext>) -> Self {
        Self { tools, context }
    }

    fn to_mcp_tool(tool: &dyn crate::traits::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, Value>> = match tool.parameters_schema() {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        }
    }

    pub fn tool_descriptors(&self) -> Vec<Tool> {
        self.tools
            .list()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect()
    }

    /// Run a tool for an MCP client.
    ///
    /// Unknown names are protocol errors; tool failures are reported in-band
    /// as an error result so the client can show them.
    pub async fn call(&self, name: &str, args: Value) -> Result<CallToolResult, McpError> {
        match self.tools.execute(name, args, self.context.clone()).await {
            Ok(result) => {
                let text = match result {
                    Value::String(s) => s,
                    other => serde_json::to_string_pretty(&other).unwrap_or_default(),
                };
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(Error::ToolNotFound(name)) => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", name),
                None,
            )),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "dev-assistant".to_string(),
                title: Some("Dev Assistant".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Development assistant tools. Use search_knowledge_base to find indexed \
                 tickets, commits, and code; question_answering to ask the chat session; \
                 the git and codebase tools to inspect a repository."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(self.tool_descriptors())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(|t| Self::to_mcp_tool(t.as_ref()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let params = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));
        self.call(&request.name, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tools::builtin_registry;
    use serde_json::json;

    fn bridge() -> McpBridge {
        let ctx = ToolContext::new(Arc::new(Config::minimal()));
        McpBridge::new(Arc::new(builtin_registry()), Arc::new(ctx))
    }

    #[test]
    fn test_descriptors_carry_schemas() {
        let bridge = bridge();
        let tools = bridge.tool_descriptors();
        assert_eq!(tools.len(), bridge.tools.len());
        let search = bridge.get_tool("search_knowledge_base").unwrap();
        assert_eq!(search.input_schema.get("type"), Some(&json!("object")));
        assert!(bridge.get_tool("nope").is_none());
    }

    #[tokio::test]
    async fn test_call_reports_failures_in_band() {
        let bridge = bridge();

        let ok = bridge
            .call("check_git_conventions", json!({"query": "demo"}))
            .await
            .unwrap();
        assert_ne!(ok.is_error, Some(true));

        let failed = bridge
            .call("search_knowledge_base", json!({}))
            .await
            .unwrap();
        assert_eq!(failed.is_error, Some(true));

        assert!(bridge.call("nope", json!({})).await.is_err());
    }
}
