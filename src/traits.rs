//! Tool trait, execution context, and the tool registry.
//!
//! Tools are small async functions that agents (and the CLI) invoke by
//! name with a JSON object of arguments. The [`ToolRegistry`] owns the
//! set of registered tools and is the only dispatch path: it validates
//! arguments against each tool's schema, runs the tool on its own task,
//! and converts every failure, including a panic, into an [`Error`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ │
//! │  │ git      │ │ codebase │ │ knowledge│ │
//! │  │ tools    │ │ tools    │ │ base/chat│ │
//! │  └──────────┘ └──────────┘ └──────────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   CLI `tools run` · POST /tools/{name} · MCP tools/call
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use dev_assistant::traits::{Tool, ToolContext, ToolRegistry};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Tool for Ping {
//!     fn name(&self) -> &str { "ping" }
//!     fn description(&self) -> &str { "Reply with pong" }
//!     fn parameters_schema(&self) -> Value {
//!         json!({ "type": "object", "properties": {} })
//!     }
//!     async fn execute(&self, _params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
//!         Ok(json!("pong"))
//!     }
//! }
//!
//! let mut tools = ToolRegistry::new();
//! tools.register(std::sync::Arc::new(Ping));
//! assert_eq!(tools.len(), 1);
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::chat::ChatSession;
use crate::config::Config;
use crate::embedding::{DisabledEmbedder, Embedder};
use crate::error::{Error, Result};
use crate::generation::{DisabledGenerator, Generator, ToolDefinition};
use crate::index::SharedIndex;

/// A named, schema-described operation an agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's name.
    ///
    /// Used as the route path (`POST /tools/{name}`), the MCP tool name,
    /// and the key in `tools.json`.
    fn name(&self) -> &str;

    /// Returns a one-line description for agent discovery.
    fn description(&self) -> &str;

    /// Whether this tool ships with the binary. Defaults to `true`.
    fn is_builtin(&self) -> bool {
        true
    }

    /// JSON Schema (`type: "object"`) describing the arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with validated parameters (always a JSON object).
    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Shared state a tool may use while executing.
///
/// Built once at startup and shared by `Arc` between the registry, the
/// HTTP server, and the MCP bridge. The copy handed to the chat session
/// itself has no `session`, so a tool call from inside a turn cannot queue
/// behind that same turn.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<Config>,
    pub index: Option<SharedIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub session: Option<Arc<ChatSession>>,
}

impl ToolContext {
    /// Context with no index, no chat session, and disabled providers.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            index: None,
            embedder: Arc::new(DisabledEmbedder),
            generator: Arc::new(DisabledGenerator),
            session: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_index(mut self, index: SharedIndex, embedder: Arc<dyn Embedder>) -> Self {
        self.index = Some(index);
        self.embedder = embedder;
        self
    }

    pub fn with_session(mut self, session: Arc<ChatSession>) -> Self {
        self.session = Some(session);
        self
    }
}

/// Ordered set of tools, unique by name.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. A tool with the same name is replaced in place,
    /// keeping its original position.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(pos) => {
                tracing::debug!(tool = tool.name(), "replacing registered tool");
                self.tools[pos] = tool;
            }
            None => self.tools.push(tool),
        }
    }

    /// Registered tools in registration order.
    pub fn list(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Function definitions for a model's tool-calling channel.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Validate `args` and run the named tool.
    ///
    /// The tool body runs on a spawned task so a panic inside it is
    /// reported as [`Error::ToolExecution`] instead of unwinding into the
    /// caller.
    pub async fn execute(&self, name: &str, args: Value, ctx: Arc<ToolContext>) -> Result<Value> {
        let tool = self
            .find(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let args = match args {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        if let Err(reason) = validate_params(&tool.parameters_schema(), &args) {
            return Err(Error::ToolExecution {
                name: name.to_string(),
                cause: format!("invalid arguments: {}", reason),
            });
        }

        tracing::debug!(tool = name, "executing tool");
        let task_tool = tool.clone();
        let handle = tokio::spawn(async move { task_tool.execute(args, &ctx).await });

        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::ToolExecution {
                name: name.to_string(),
                cause: format!("{:#}", e),
            }),
            Err(join) => Err(Error::ToolExecution {
                name: name.to_string(),
                cause: if join.is_panic() {
                    "tool panicked".to_string()
                } else {
                    join.to_string()
                },
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `params` against a JSON Schema object: the value must be an
/// object, every `required` key must be present, and each property with a
/// primitive `type` must match it. Unknown keys are allowed.
pub fn validate_params(schema: &Value, params: &Value) -> std::result::Result<(), String> {
    let obj = params
        .as_object()
        .ok_or_else(|| "arguments must be a JSON object".to_string())?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required argument '{}'", key));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let expected = props
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str());
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(format!("argument '{}' must be of type {}", key, expected));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            self.0
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" }, "times": { "type": "integer" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            Ok(params["text"].clone())
        }
    }

    struct Boom;

    #[async_trait]
    impl Tool for Boom {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            panic!("kaboom")
        }
    }

    fn ctx() -> Arc<ToolContext> {
        Arc::new(ToolContext::new(Arc::new(Config::minimal())))
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo("first")));
        registry.register(Arc::new(Boom));
        registry.register(Arc::new(Echo("second")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list()[0].description(), "second");
        assert_eq!(registry.list()[1].name(), "boom");
    }

    #[test]
    fn test_definitions_mirror_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo("repeat text")));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].description, "repeat text");
        assert_eq!(defs[0].parameters["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({}), ctx()).await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_execute_validates_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo("e")));

        let out = registry
            .execute("echo", json!({"text": "hi"}), ctx())
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));

        let err = registry.execute("echo", json!({}), ctx()).await.unwrap_err();
        assert!(err.to_string().contains("missing required argument 'text'"));

        let err = registry
            .execute("echo", json!({"text": "hi", "times": "two"}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn test_panicking_tool_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Boom));
        let err = registry.execute("boom", Value::Null, ctx()).await.unwrap_err();
        match err {
            Error::ToolExecution { name, cause } => {
                assert_eq!(name, "boom");
                assert!(cause.contains("panicked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
