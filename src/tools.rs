//! Built-in tools and the `tools.json` loader.
//!
//! Every built-in tool is registered through one startup table
//! ([`builtin_constructors`]) mapping a reference name to a constructor.
//! `tools.json` entries pick implementations from that table by `ref`
//! (defaulting to the entry's `name`); an unknown reference fails at load
//! time rather than on first call.
//!
//! ```json
//! [
//!   { "name": "check_git_conventions", "description": "...", "args_schema": { ... } },
//!   { "name": "kb", "ref": "search_knowledge_base" }
//! ]
//! ```

use anyhow::{bail, Context};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::codebase::{scan_codebase, summarize, Language};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::generation::Prompt;
use crate::index::EmbeddingIndex;
use crate::ingest::{build_index, normalize_payload};
use crate::models::SourceKind;
use crate::sources;
use crate::traits::{Tool, ToolContext, ToolRegistry};

const DEFAULT_ENDPOINT: &str = "http://localhost:5000/api/summarise";
const SEARCH_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const PRD_INSTRUCTIONS: &str = "You are a product manager. Summarize the JIRA tickets in the \
     context into a product requirements document with these sections: Overview, Goals, \
     Requirements (one bullet per ticket, citing its key), Open Issues. Use only the tickets given.";

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn is_demo(params: &Value) -> bool {
    str_param(params, "query")
        .map(|q| q.trim().eq_ignore_ascii_case("demo"))
        .unwrap_or(false)
}

fn path_param(params: &Value, key: &str) -> PathBuf {
    PathBuf::from(str_param(params, key).unwrap_or("."))
}

fn query_schema(extra: Value) -> Value {
    let mut properties = json!({
        "query": { "type": "string", "description": "Free-text request; \"demo\" returns sample output" }
    });
    if let (Some(props), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            props.insert(k.clone(), v.clone());
        }
    }
    json!({ "type": "object", "properties": properties, "required": ["query"] })
}

fn ranked_list(items: &[(String, usize)]) -> String {
    items
        .iter()
        .map(|(name, n)| format!("{} ({})", name, n))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============ Git tools ============

pub struct CheckGitConventions;

#[async_trait]
impl Tool for CheckGitConventions {
    fn name(&self) -> &str {
        "check_git_conventions"
    }
    fn description(&self) -> &str {
        "Sample the last 10 commit subjects and report the commit-message prefixes in use"
    }
    fn parameters_schema(&self) -> Value {
        query_schema(json!({ "repo": { "type": "string", "description": "Repository path (default: .)" } }))
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        if is_demo(&params) {
            return Ok(json!(
                "Git conventions (demo data): 10 recent commits sampled. Common prefixes: feat (5), fix (3), docs (2). Conventional commit format is in use."
            ));
        }
        let subjects = sources::recent_subjects(&path_param(&params, "repo"), 10)?;
        let prefixes = sources::commit_prefixes(&subjects);
        let top: Vec<_> = prefixes.into_iter().take(5).collect();
        Ok(json!(format!(
            "Git analysis complete. Found {} recent commits. Common prefixes: {}. Suggests using conventional commit format.",
            subjects.len(),
            if top.is_empty() { "none".to_string() } else { ranked_list(&top) }
        )))
    }
}

pub struct AnalyzeGitHistory;

#[async_trait]
impl Tool for AnalyzeGitHistory {
    fn name(&self) -> &str {
        "analyze_git_history"
    }
    fn description(&self) -> &str {
        "Rank the top contributors over the last 20 commits"
    }
    fn parameters_schema(&self) -> Value {
        query_schema(json!({ "repo": { "type": "string", "description": "Repository path (default: .)" } }))
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        if is_demo(&params) {
            return Ok(json!(
                "Git history analysis (demo data): Top contributors: alice (9), bob (7), carol (4). Total commits analyzed: 20"
            ));
        }
        let (mut ranked, total) = sources::contributors(&path_param(&params, "repo"), 20)?;
        ranked.truncate(3);
        Ok(json!(format!(
            "Git history analysis: Top contributors: {}. Total commits analyzed: {}",
            ranked_list(&ranked),
            total
        )))
    }
}

pub struct FetchGitHistory;

#[async_trait]
impl Tool for FetchGitHistory {
    fn name(&self) -> &str {
        "fetch_git_history"
    }
    fn description(&self) -> &str {
        "Read a local or remote repository's commit history and write it as an ingestable JSON payload"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repo": { "type": "string", "description": "Repository path (default: .)" },
                "url": { "type": "string", "description": "Remote to shallow-clone instead of repo" },
                "branch": { "type": "string", "description": "Branch to clone with url" },
                "auth_token": { "type": "string", "description": "GitHub token for private remotes" },
                "max_commits": { "type": "integer", "default": 100 },
                "output": { "type": "string", "description": "Output file (default: ./data/git_history.json)" }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let max_commits = params
            .get("max_commits")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;
        let output = PathBuf::from(str_param(&params, "output").unwrap_or("./data/git_history.json"));

        let payload = match str_param(&params, "url") {
            Some(url) => {
                let url = url.to_string();
                let branch = str_param(&params, "branch").map(str::to_string);
                let token = str_param(&params, "auth_token").map(str::to_string);
                tokio::task::spawn_blocking(move || {
                    sources::fetch_remote_git_history(
                        &url,
                        branch.as_deref(),
                        token.as_deref(),
                        max_commits,
                    )
                })
                .await??
            }
            None => sources::fetch_git_history(&path_param(&params, "repo"), max_commits)?,
        };
        sources::write_payload(&output, &payload)?;
        Ok(json!({
            "output": output.display().to_string(),
            "commits": payload["metadata"]["total_commits_fetched"],
        }))
    }
}

// ============ Codebase tools ============

fn language_in_query(query: &str) -> Option<Language> {
    let q = query.to_lowercase();
    // "javascript" contains "java", so check it first.
    if q.contains("javascript") || q.split_whitespace().any(|w| w == "js") {
        Some(Language::JavaScript)
    } else if q.contains("typescript") {
        Some(Language::TypeScript)
    } else if q.contains("python") {
        Some(Language::Python)
    } else if q.contains("java") {
        Some(Language::Java)
    } else if q.contains("rust") {
        Some(Language::Rust)
    } else if q.split_whitespace().any(|w| w == "go" || w == "golang") {
        Some(Language::Go)
    } else if q.contains("c++") || q.contains("cpp") {
        Some(Language::Cpp)
    } else {
        None
    }
}

pub struct ScanCodebase;

#[async_trait]
impl Tool for ScanCodebase {
    fn name(&self) -> &str {
        "scan_codebase"
    }
    fn description(&self) -> &str {
        "Count source files and symbols under a directory, optionally for one language named in the query"
    }
    fn parameters_schema(&self) -> Value {
        query_schema(json!({ "root": { "type": "string", "description": "Directory to scan (default: .)" } }))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        if is_demo(&params) {
            return Ok(json!(
                "Codebase scan completed (demo data). Found 12 files and 48 symbols. Languages: python (7), javascript (5)."
            ));
        }
        let root = path_param(&params, "root");
        let language = str_param(&params, "query").and_then(language_in_query);
        let codebase = &ctx.config.codebase;

        let mut entities = scan_codebase(&root, &codebase.include_globs, &codebase.exclude_globs)?;
        if let Some(lang) = language {
            entities.retain(|e| e.language == lang);
        }
        let summary = summarize(&entities);
        let languages = summary
            .languages
            .iter()
            .map(|(l, n)| format!("{} ({})", l, n))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(json!(format!(
            "Codebase scan completed. Found {} files and {} symbols. Languages: {}.",
            summary.files,
            summary.symbols,
            if languages.is_empty() { "none".to_string() } else { languages }
        )))
    }
}

pub struct AnalyzeFolderStructure;

#[async_trait]
impl Tool for AnalyzeFolderStructure {
    fn name(&self) -> &str {
        "analyze_folder_structure"
    }
    fn description(&self) -> &str {
        "List the top-level directories of a project"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "root": { "type": "string", "description": "Directory to inspect (default: .)" }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let root = path_param(&params, "root");
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&root)
            .with_context(|| format!("Failed to read directory: {}", root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                dirs.push(name);
            }
        }
        dirs.sort();
        Ok(json!({ "root": root.display().to_string(), "directories": dirs }))
    }
}

// ============ JIRA tools ============

pub struct AnalyzeJiraHistory;

#[async_trait]
impl Tool for AnalyzeJiraHistory {
    fn name(&self) -> &str {
        "analyze_jira_history"
    }
    fn description(&self) -> &str {
        "Summarize the imported JIRA ticket index and find tickets related to the query"
    }
    fn parameters_schema(&self) -> Value {
        query_schema(json!({}))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let path = ctx.config.index_path("jira");
        if !path.exists() {
            return Ok(json!(
                "No JIRA data imported yet. Run `dax fetch jira --jql <query>` and `dax ingest jira` first, or call import_jira_tickets with ingest=true."
            ));
        }

        let index = EmbeddingIndex::load(&path)?;
        let mut report = format!("JIRA index '{}' holds {} tickets.", path.display(), index.len());

        if let Some(query) = str_param(&params, "query") {
            if ctx.embedder.dims() > 0 && ctx.embedder.model_name() == index.model() {
                let hits = index.search(ctx.embedder.as_ref(), query, 5).await?;
                let ids: Vec<_> = hits.iter().map(|h| h.document.id.as_str()).collect();
                report.push_str(&format!(" Related to '{}': {}.", query, ids.join(", ")));
            }
        }
        Ok(json!(report))
    }
}

pub struct ImportJiraTickets;

#[async_trait]
impl Tool for ImportJiraTickets {
    fn name(&self) -> &str {
        "import_jira_tickets"
    }
    fn description(&self) -> &str {
        "Fetch tickets with a JQL query and write them as an ingestable JSON payload"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "jql": { "type": "string", "description": "JQL query, e.g. project = TK" },
                "output": { "type": "string", "description": "Output file (default: ./data/jira_tickets.json)" },
                "ingest": { "type": "boolean", "description": "Also add the tickets to the jira index" }
            },
            "required": ["jql"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let jql = str_param(&params, "jql").unwrap_or_default();
        if jql.trim().is_empty() {
            bail!("jql must not be empty");
        }
        let output = PathBuf::from(str_param(&params, "output").unwrap_or("./data/jira_tickets.json"));

        let payload = sources::fetch_jira_tickets(&ctx.config.jira, jql).await?;
        sources::write_payload(&output, &payload)?;

        let mut result = json!({
            "output": output.display().to_string(),
            "tickets": payload["tickets"].as_array().map(|t| t.len()).unwrap_or(0),
        });

        if params.get("ingest").and_then(|v| v.as_bool()).unwrap_or(false) {
            let summary = build_index(
                SourceKind::Jira,
                &payload,
                &ctx.config.index_path("jira"),
                ctx.embedder.as_ref(),
                ctx.config.embedding.batch_size,
            )
            .await?;
            result["index"] = serde_json::to_value(summary)?;
        }
        Ok(result)
    }
}

pub struct SummarizeJiraTickets;

#[async_trait]
impl Tool for SummarizeJiraTickets {
    fn name(&self) -> &str {
        "summarize_jira_tickets"
    }
    fn description(&self) -> &str {
        "Fetch JIRA tickets (or read a saved payload), summarize them into a PRD, and save both as JSON"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "jql": { "type": "string", "description": "JQL query, e.g. created >= -20d" },
                "input": { "type": "string", "description": "Saved jira payload to use instead of a JQL fetch" },
                "output": { "type": "string", "description": "Output file (default: ./data/jira_prd.json)" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let payload = match (str_param(&params, "input"), str_param(&params, "jql")) {
            (Some(input), _) => {
                let raw = std::fs::read_to_string(input)
                    .with_context(|| format!("Failed to read payload: {}", input))?;
                serde_json::from_str::<Value>(&raw)
                    .with_context(|| format!("Failed to parse payload: {}", input))?
            }
            (None, Some(jql)) => sources::fetch_jira_tickets(&ctx.config.jira, jql).await?,
            (None, None) => bail!("either jql or input is required"),
        };
        let documents = normalize_payload(SourceKind::Jira, &payload)?;
        if documents.is_empty() {
            bail!("no tickets to summarize");
        }

        let prompt = Prompt {
            system: PRD_INSTRUCTIONS.to_string(),
            context: documents
                .iter()
                .map(|d| d.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n"),
            user: format!("Write the PRD for these {} tickets.", documents.len()),
            ..Prompt::default()
        };
        let prd = ctx.generator.complete(&prompt).await?;

        let output = PathBuf::from(str_param(&params, "output").unwrap_or("./data/jira_prd.json"));
        sources::write_payload(
            &output,
            &json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "ticket_count": documents.len(),
                "tickets": payload["tickets"],
                "prd": prd,
            }),
        )?;
        Ok(json!({
            "output": output.display().to_string(),
            "tickets": documents.len(),
            "prd": prd,
        }))
    }
}

// ============ Knowledge base tools ============

pub struct SearchKnowledgeBase;

#[async_trait]
impl Tool for SearchKnowledgeBase {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }
    fn description(&self) -> &str {
        "Semantic search over the merged JIRA, git, and codebase index"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let query = str_param(&params, "query").unwrap_or_default();
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let index = ctx
            .index
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No index is loaded; ingest data and restart"))?;
        // Negative limits from callers are treated as zero.
        let limit = params
            .get("limit")
            .and_then(|v| v.as_i64())
            .map(|l| l.max(0) as usize)
            .unwrap_or(ctx.config.chat.top_k);

        let hits = index.search(ctx.embedder.as_ref(), query, limit).await?;
        let results: Vec<Value> = hits
            .iter()
            .map(|h| {
                json!({
                    "id": h.document.id,
                    "score": h.score,
                    "text": h.document.text,
                    "metadata": h.document.metadata,
                })
            })
            .collect();
        Ok(json!({ "results": results }))
    }
}

pub struct QuestionAnswering;

#[async_trait]
impl Tool for QuestionAnswering {
    fn name(&self) -> &str {
        "question_answering"
    }
    fn description(&self) -> &str {
        "Answer a question with the retrieval-augmented chat session"
    }
    fn parameters_schema(&self) -> Value {
        query_schema(json!({}))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let query = str_param(&params, "query").unwrap_or_default();
        let session = ctx
            .session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No chat session is configured"))?;
        let answer = session.chat(query).await?;
        Ok(json!({ "answer": answer, "session_id": session.id() }))
    }
}

pub struct CustomApi;

#[async_trait]
impl Tool for CustomApi {
    fn name(&self) -> &str {
        "custom_api"
    }
    fn description(&self) -> &str {
        "POST {\"input\": ...} to an internal HTTP service and return its JSON response"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": { "type": "string" },
                "endpoint": { "type": "string", "description": "Override the configured endpoint" }
            },
            "required": ["input"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let endpoint = str_param(&params, "endpoint")
            .map(str::to_string)
            .or_else(|| ctx.config.tools.custom_api_url.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let response = reqwest::Client::new()
            .post(&endpoint)
            .json(&json!({ "input": params["input"] }))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", endpoint))?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

// ============ Web search ============

/// DuckDuckGo result links are redirects carrying the target in `uddg`.
fn result_link(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };
    reqwest::Url::parse(&absolute)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

/// Titles and links from an HTML results page, at most `limit`.
fn parse_search_results(html: &str, limit: usize) -> anyhow::Result<Vec<Value>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(".result__title a")
        .map_err(|e| anyhow::anyhow!("invalid result selector: {:?}", e))?;

    Ok(document
        .select(&selector)
        .filter_map(|anchor| {
            let title = anchor.text().collect::<String>().trim().to_string();
            let href = anchor.value().attr("href")?;
            if title.is_empty() {
                return None;
            }
            Some(json!({ "title": title, "link": result_link(href) }))
        })
        .take(limit)
        .collect())
}

pub struct WebSearch;

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web without an API key and return the top result titles and links"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search terms" },
                "limit": { "type": "integer", "description": "Max results (default: 5)" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let query = str_param(&params, "query").unwrap_or_default();
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;
        let url = &ctx.config.tools.web_search_url;

        let html = reqwest::Client::builder()
            .user_agent(SEARCH_USER_AGENT)
            .timeout(Duration::from_secs(20))
            .build()?
            .post(url)
            .form(&[("q", query)])
            .send()
            .await
            .with_context(|| format!("Search request to {} failed", url))?
            .error_for_status()?
            .text()
            .await?;

        let results = parse_search_results(&html, limit)?;
        tracing::debug!(query, results = results.len(), "web search");
        Ok(Value::Array(results))
    }
}

// ============ Registry wiring ============

type Constructor = fn() -> Arc<dyn Tool>;

/// The startup table: reference name → constructor, in listing order.
pub fn builtin_constructors() -> Vec<(&'static str, Constructor)> {
    let table: [(&'static str, Constructor); 12] = [
        ("check_git_conventions", || -> Arc<dyn Tool> { Arc::new(CheckGitConventions) }),
        ("analyze_git_history", || -> Arc<dyn Tool> { Arc::new(AnalyzeGitHistory) }),
        ("fetch_git_history", || -> Arc<dyn Tool> { Arc::new(FetchGitHistory) }),
        ("scan_codebase", || -> Arc<dyn Tool> { Arc::new(ScanCodebase) }),
        ("analyze_folder_structure", || -> Arc<dyn Tool> { Arc::new(AnalyzeFolderStructure) }),
        ("analyze_jira_history", || -> Arc<dyn Tool> { Arc::new(AnalyzeJiraHistory) }),
        ("import_jira_tickets", || -> Arc<dyn Tool> { Arc::new(ImportJiraTickets) }),
        ("summarize_jira_tickets", || -> Arc<dyn Tool> { Arc::new(SummarizeJiraTickets) }),
        ("search_knowledge_base", || -> Arc<dyn Tool> { Arc::new(SearchKnowledgeBase) }),
        ("question_answering", || -> Arc<dyn Tool> { Arc::new(QuestionAnswering) }),
        ("custom_api", || -> Arc<dyn Tool> { Arc::new(CustomApi) }),
        ("web_search", || -> Arc<dyn Tool> { Arc::new(WebSearch) }),
    ];
    table.to_vec()
}

/// A registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for (_, construct) in builtin_constructors() {
        registry.register(construct());
    }
    registry
}

/// One `tools.json` record.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    /// Built-in implementation to use. Defaults to `name`.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    /// Source module of older configs; informational only.
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub args_schema: Option<Value>,
}

/// A built-in exposed under a configured name, description, or schema.
struct ConfiguredTool {
    name: String,
    description: String,
    schema: Value,
    inner: Arc<dyn Tool>,
}

#[async_trait]
impl Tool for ConfiguredTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }
    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        self.inner.execute(params, ctx).await
    }
}

/// Accepts a full JSON Schema, or a bare `{arg: {type}}` map whose keys are
/// all required.
fn normalize_schema(schema: Value) -> Value {
    let empty = json!({ "type": "object", "properties": {} });
    let Some(obj) = schema.as_object() else {
        return empty;
    };
    if obj.contains_key("type") || obj.contains_key("properties") {
        return schema;
    }
    if obj.is_empty() {
        return empty;
    }
    let required: Vec<String> = obj.keys().cloned().collect();
    json!({ "type": "object", "properties": obj, "required": required })
}

pub fn load_tool_specs(path: &Path) -> Result<Vec<ToolSpec>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("invalid tool configuration {}: {}", path.display(), e))
    })
}

/// Build a registry from `tools.json` records. Fails on the first record
/// whose reference is not a built-in.
pub fn registry_from_specs(specs: &[ToolSpec]) -> Result<ToolRegistry> {
    let table = builtin_constructors();
    let mut registry = ToolRegistry::new();

    for entry in specs {
        let reference = entry.reference.as_deref().unwrap_or(&entry.name);
        let construct = table
            .iter()
            .find(|(name, _)| *name == reference)
            .map(|(_, c)| *c)
            .ok_or_else(|| {
                Error::Config(format!(
                    "tool '{}' references unknown implementation '{}'",
                    entry.name, reference
                ))
            })?;
        let inner = construct();

        let tool = ConfiguredTool {
            name: entry.name.clone(),
            description: entry
                .description
                .clone()
                .unwrap_or_else(|| inner.description().to_string()),
            schema: entry
                .args_schema
                .clone()
                .map(normalize_schema)
                .unwrap_or_else(|| inner.parameters_schema()),
            inner,
        };
        registry.register(Arc::new(tool));
    }

    Ok(registry)
}

/// The registry for `config`: from `tools.config` when that file exists,
/// otherwise every built-in.
pub fn build_registry(config: &Config) -> Result<ToolRegistry> {
    let path = &config.tools.config;
    if path.exists() {
        let specs = load_tool_specs(path)?;
        tracing::info!(path = %path.display(), tools = specs.len(), "loaded tool configuration");
        registry_from_specs(&specs)
    } else {
        Ok(builtin_registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> Arc<ToolContext> {
        Arc::new(ToolContext::new(Arc::new(Config::minimal())))
    }

    #[tokio::test]
    async fn test_demo_queries_return_demo_text() {
        let registry = builtin_registry();
        for name in ["check_git_conventions", "analyze_git_history", "scan_codebase"] {
            let out = registry
                .execute(name, json!({"query": "demo"}), ctx())
                .await
                .unwrap();
            assert!(
                out.as_str().unwrap().to_lowercase().contains("demo"),
                "{name} did not return demo text"
            );
        }
    }

    #[test]
    fn test_builtin_listing_order() {
        let registry = builtin_registry();
        let names: Vec<_> = registry.list().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "check_git_conventions");
        assert_eq!(names[10], "custom_api");
        assert_eq!(names[11], "web_search");
    }

    #[test]
    fn test_specs_resolve_refs_and_fail_fast() {
        let specs: Vec<ToolSpec> = serde_json::from_value(json!([
            {"name": "scan_codebase", "module": "tools.development.codebase_tools",
             "description": "Scan", "args_schema": {"query": {"type": "string"}}},
            {"name": "kb", "ref": "search_knowledge_base"}
        ]))
        .unwrap();
        let registry = registry_from_specs(&specs).unwrap();
        assert_eq!(registry.len(), 2);
        let scan = registry.find("scan_codebase").unwrap();
        assert_eq!(scan.description(), "Scan");
        assert_eq!(scan.parameters_schema()["required"], json!(["query"]));
        assert_eq!(
            registry.find("kb").unwrap().description(),
            SearchKnowledgeBase.description()
        );

        let bad: Vec<ToolSpec> =
            serde_json::from_value(json!([{"name": "send_email"}])).unwrap();
        let err = registry_from_specs(&bad).err().unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("send_email")));

        let renamed: Vec<ToolSpec> =
            serde_json::from_value(json!([{"name": "google_search", "ref": "web_search"}]))
                .unwrap();
        assert!(registry_from_specs(&renamed).unwrap().find("google_search").is_some());
    }

    #[tokio::test]
    async fn test_folder_structure_lists_visible_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("README.md"), "x").unwrap();

        let out = builtin_registry()
            .execute(
                "analyze_folder_structure",
                json!({"root": tmp.path().to_string_lossy()}),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out["directories"], json!(["src"]));
    }

    #[tokio::test]
    async fn test_knowledge_tools_need_state() {
        let registry = builtin_registry();
        let err = registry
            .execute("search_knowledge_base", json!({"query": "login"}), ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No index is loaded"));

        let err = registry
            .execute("question_answering", json!({"query": "why?"}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }

    #[test]
    fn test_parse_search_results() {
        let html = r#"<html><body>
            <div class="result"><h2 class="result__title">
              <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fdocs.rs%2Ftokio&amp;rut=x">Tokio docs</a>
            </h2></div>
            <div class="result"><h2 class="result__title">
              <a class="result__a" href="https://www.rust-lang.org/">Rust</a>
            </h2></div>
            <div class="result"><h2 class="result__title"><a href="/empty">  </a></h2></div>
        </body></html>"#;
        let results = parse_search_results(html, 5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["title"], "Tokio docs");
        assert_eq!(results[0]["link"], "https://docs.rs/tokio");
        assert_eq!(results[1]["link"], "https://www.rust-lang.org/");

        assert_eq!(parse_search_results(html, 1).unwrap().len(), 1);
        assert!(parse_search_results("<p>no results</p>", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarize_jira_tickets_from_saved_payload() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("tickets.json");
        let output = tmp.path().join("prd.json");
        std::fs::write(
            &input,
            r#"{"tickets": [{"key": "TK-1", "summary": "Fix login bug"}, {"key": "TK-2", "summary": "Add dark mode"}]}"#,
        )
        .unwrap();
        let args = json!({
            "input": input.to_string_lossy(),
            "output": output.to_string_lossy(),
        });

        let echo_ctx = ToolContext::new(Arc::new(Config::minimal()))
            .with_generator(Arc::new(crate::generation::EchoGenerator));
        let out = builtin_registry()
            .execute("summarize_jira_tickets", args.clone(), Arc::new(echo_ctx))
            .await
            .unwrap();
        assert_eq!(out["tickets"], 2);
        assert!(out["prd"].as_str().unwrap().contains("TK-2"));

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(saved["ticket_count"], 2);
        assert_eq!(saved["tickets"][0]["key"], "TK-1");

        // The default context has a disabled generator.
        let err = builtin_registry()
            .execute("summarize_jira_tickets", args, ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_language_in_query() {
        assert_eq!(language_in_query("javascript naming"), Some(Language::JavaScript));
        assert_eq!(language_in_query("java classes"), Some(Language::Java));
        assert_eq!(language_in_query("everything"), None);
    }

    #[test]
    fn test_example_tools_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/tools.example.json");
        let registry = registry_from_specs(&load_tool_specs(&path).unwrap()).unwrap();
        assert_eq!(registry.len(), 6);
        assert!(registry.find("kb_search").is_some());
        let schema = registry.find("analyze_git_history").unwrap().parameters_schema();
        assert_eq!(schema["required"], json!(["query"]));
    }
}
