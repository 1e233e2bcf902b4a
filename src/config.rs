//! TOML configuration for the `dax` binary and the library front-ends.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! See `config/dax.example.toml` for a commented example.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub jira: JiraConfig,
    #[serde(default)]
    pub codebase: CodebaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_index_name")]
    pub default: String,
    /// Further index names merged into the default one at startup.
    #[serde(default)]
    pub merge: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
            default: default_index_name(),
            merge: Vec::new(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/indexes")
}
fn default_index_name() -> String {
    "knowledge".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_embedding_timeout(),
            base_url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Extra attempts after the first failed completion call.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout(),
            base_url: None,
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_generation_retries() -> u32 {
    2
}
fn default_generation_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_context_char_limit")]
    pub context_char_limit: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Tool-call rounds the model may request per turn; 0 disables tool
    /// calling.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_char_limit: default_context_char_limit(),
            history_window: default_history_window(),
            sessions_dir: default_sessions_dir(),
            system_prompt: default_system_prompt(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_context_char_limit() -> usize {
    6000
}
fn default_history_window() -> usize {
    12
}
fn default_max_tool_rounds() -> usize {
    3
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}
fn default_system_prompt() -> String {
    "You are a development assistant for a software team. Answer using the \
     provided context from JIRA tickets, git history, and the codebase. If the \
     context does not contain the answer, say so instead of guessing."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default = "default_tools_config")]
    pub config: PathBuf,
    /// Endpoint used by the `custom_api` tool.
    #[serde(default)]
    pub custom_api_url: Option<String>,
    /// HTML results page queried by the `web_search` tool.
    #[serde(default = "default_web_search_url")]
    pub web_search_url: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            config: default_tools_config(),
            custom_api_url: None,
            web_search_url: default_web_search_url(),
        }
    }
}

fn default_web_search_url() -> String {
    "https://html.duckduckgo.com/html/".to_string()
}

fn default_tools_config() -> PathBuf {
    PathBuf::from("./tools.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    /// e.g. `https://yourcompany.atlassian.net`
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            domain: None,
            user: None,
            token_env: default_token_env(),
            max_results: default_max_results(),
        }
    }
}

fn default_token_env() -> String {
    "JIRA_API_TOKEN".to_string()
}
fn default_max_results() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CodebaseConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for CodebaseConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.rs", "**/*.py", "**/*.js", "**/*.jsx", "**/*.ts", "**/*.tsx", "**/*.java",
        "**/*.go", "**/*.c", "**/*.h", "**/*.cpp", "**/*.hpp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
        "**/__pycache__/**".to_string(),
    ]
}

impl Config {
    /// All-defaults configuration, used when no config file is given.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Path of the named index file under `index.dir`.
    pub fn index_path(&self, name: &str) -> PathBuf {
        self.index.dir.join(format!("{}.idx", name))
    }

    pub fn default_index_path(&self) -> PathBuf {
        self.index_path(&self.index.default)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hash" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "echo" => {}
        "openai" | "mistral" => {
            if config.generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, mistral, or echo.",
            other
        ),
    }

    // Validate chat
    if config.chat.top_k < 1 {
        anyhow::bail!("chat.top_k must be >= 1");
    }
    if config.chat.context_char_limit == 0 {
        anyhow::bail!("chat.context_char_limit must be > 0");
    }

    Ok(())
}
