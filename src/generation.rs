//! Text-generation collaborators.
//!
//! The chat session builds a [`Prompt`] and hands it to a [`Generator`].
//! Generators make exactly one completion call per `complete`; retrying is
//! the session's job.
//!
//! | `generation.provider` | Generator |
//! |---|---|
//! | `"disabled"` | [`DisabledGenerator`] |
//! | `"openai"` | [`ChatCompletionsGenerator::openai`] (`POST /v1/chat/completions`) |
//! | `"mistral"` | [`ChatCompletionsGenerator::mistral`] (same request shape) |
//! | `"echo"` | [`EchoGenerator`] (offline, deterministic) |
//!
//! When a prompt carries tool definitions, [`Generator::complete_with_tools`]
//! may return [`Completion::ToolCalls`] instead of text. Generators without
//! a function-calling channel keep the default, which always answers in text.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::models::Turn;

/// A tool the model may call, as advertised in the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool call together with the text sent back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    /// Prior turns, oldest first, already trimmed to the history window.
    pub history: Vec<Turn>,
    /// Rendered retrieval context; empty when nothing was retrieved.
    pub context: String,
    pub user: String,
    /// Tools the model may call this round; empty means text only.
    pub tools: Vec<ToolDefinition>,
    /// Calls already made this turn, oldest first.
    pub tool_exchanges: Vec<ToolExchange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

impl Prompt {
    /// Chat-completions message list: system, history, the user turn with
    /// the retrieved context prepended, then any tool calls and results.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages =
            Vec::with_capacity(self.history.len() + 2 + 2 * self.tool_exchanges.len());
        if !self.system.is_empty() {
            messages.push(ChatMessage::new("system", self.system.clone()));
        }
        for turn in &self.history {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.content.clone()));
        }
        messages.push(ChatMessage::new("user", self.user_block()));

        for exchange in &self.tool_exchanges {
            let call = &exchange.call;
            messages.push(ChatMessage {
                tool_calls: Some(json!([{
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments.to_string() },
                }])),
                ..ChatMessage::new("assistant", "")
            });
            messages.push(ChatMessage {
                tool_call_id: Some(call.id.clone()),
                ..ChatMessage::new("tool", exchange.result.clone())
            });
        }
        messages
    }

    fn user_block(&self) -> String {
        if self.context.is_empty() {
            self.user.clone()
        } else {
            format!("Context:\n{}\n\nQuestion: {}", self.context, self.user)
        }
    }

    /// Single-string rendering for logs and plain-completion backends.
    pub fn render(&self) -> String {
        self.to_messages()
            .iter()
            .map(|m| match &m.tool_calls {
                Some(calls) => format!("[{}]\n{}", m.role, calls),
                None => format!("[{}]\n{}", m.role, m.content),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, prompt: &Prompt) -> Result<String>;

    /// Like [`Generator::complete`], but the model may ask for tool calls
    /// when `prompt.tools` is non-empty.
    async fn complete_with_tools(&self, prompt: &Prompt) -> Result<Completion> {
        Ok(Completion::Text(self.complete(prompt).await?))
    }
}

/// Refuses every call. Used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _prompt: &Prompt) -> Result<String> {
        bail!("Generation provider is disabled; set [generation].provider in the config")
    }
}

/// Deterministic offline generator that answers with the retrieved context.
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        if prompt.context.is_empty() {
            Ok(format!("No indexed context matched: {}", prompt.user))
        } else {
            Ok(format!("Relevant context:\n{}", prompt.context))
        }
    }
}

/// Non-streaming chat completions against an OpenAI-compatible endpoint.
///
/// OpenAI and Mistral share the request and response shape, including
/// `tools` / `tool_calls`; only the base URL and key variable differ.
pub struct ChatCompletionsGenerator {
    provider: &'static str,
    model: String,
    temperature: f32,
    max_tokens: u32,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    /// Requires `OPENAI_API_KEY`.
    pub fn openai(config: &GenerationConfig) -> Result<Self> {
        Self::new("openai", "https://api.openai.com/v1", "OPENAI_API_KEY", config)
    }

    /// Requires `MISTRAL_API_KEY`.
    pub fn mistral(config: &GenerationConfig) -> Result<Self> {
        Self::new("mistral", "https://api.mistral.ai/v1", "MISTRAL_API_KEY", config)
    }

    fn new(
        provider: &'static str,
        default_base: &str,
        key_env: &str,
        config: &GenerationConfig,
    ) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            anyhow::anyhow!("generation.model required for {} provider", provider)
        })?;
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", key_env))?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": prompt.to_messages(),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });
        if !prompt.tools.is_empty() {
            let tools: Vec<Value> = prompt
                .tools
                .iter()
                .map(|t| json!({ "type": "function", "function": t }))
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    async fn send(&self, prompt: &Prompt) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{} API error {}: {}", self.provider, status, text);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let json = self.send(prompt).await?;
        parse_completion(&json)
    }

    async fn complete_with_tools(&self, prompt: &Prompt) -> Result<Completion> {
        let json = self.send(prompt).await?;
        let calls = parse_tool_calls(&json);
        if calls.is_empty() {
            Ok(Completion::Text(parse_completion(&json)?))
        } else {
            Ok(Completion::ToolCalls(calls))
        }
    }
}

fn parse_completion(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))
}

/// `choices[0].message.tool_calls`, with each `arguments` string decoded.
/// Arguments that are not valid JSON are passed through as a string, which
/// the tool registry then rejects.
fn parse_tool_calls(json: &Value) -> Vec<ToolCall> {
    let Some(calls) = json
        .pointer("/choices/0/message/tool_calls")
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                Some(other) => other.clone(),
                None => json!({}),
            };
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", i));
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(ChatCompletionsGenerator::openai(config)?)),
        "mistral" => Ok(Arc::new(ChatCompletionsGenerator::mistral(config)?)),
        "echo" => Ok(Arc::new(EchoGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
