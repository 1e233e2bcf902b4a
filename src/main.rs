//! # Dev Assistant CLI (`dax`)
//!
//! Commands for fetching raw data, building and merging indexes, searching,
//! chatting, running tools, and starting the HTTP/MCP server.
//!
//! ## Usage
//!
//! ```bash
//! dax --config ./config/dax.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dax fetch git` | Dump local (or `--url` remote) git history to a JSON payload |
//! | `dax fetch jira --jql "<q>"` | Dump JIRA search results to a JSON payload |
//! | `dax ingest <kind>` | Normalize, embed, and add a payload to an index |
//! | `dax merge <out> <in>...` | Merge index files left to right |
//! | `dax search "<query>"` | Nearest documents in an index |
//! | `dax chat` | Interactive or one-shot chat turn |
//! | `dax tools list` | Registered tools |
//! | `dax tools run <name>` | Call a tool with `--arg key=value` pairs |
//! | `dax serve` | HTTP + MCP server |
//!
//! Without `--config`, `./config/dax.toml` is used when present, otherwise
//! built-in defaults.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use dev_assistant::codebase;
use dev_assistant::config::{self, Config};
use dev_assistant::embedding::create_embedder;
use dev_assistant::index::{EmbeddingIndex, SharedIndex};
use dev_assistant::ingest::build_index;
use dev_assistant::logging;
use dev_assistant::models::SourceKind;
use dev_assistant::server::{self, AppCore};
use dev_assistant::sources;
use dev_assistant::tools::build_registry;
use dev_assistant::traits::ToolContext;

const DEFAULT_CONFIG: &str = "./config/dax.toml";

/// Dev Assistant CLI: retrieval-augmented answers over tickets, commits,
/// and code.
#[derive(Parser)]
#[command(
    name = "dax",
    about = "Dev Assistant: retrieval-augmented answers over JIRA tickets, git history, and code",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Defaults to `./config/dax.toml`
    /// if it exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch raw records from a source into a JSON payload file.
    Fetch {
        #[command(subcommand)]
        source: FetchSource,
    },

    /// Ingest a payload into an index.
    ///
    /// Records are validated, normalized, embedded, and upserted by id.
    /// Running the same ingest twice leaves the index unchanged.
    Ingest {
        /// Source kind: `jira`, `git`, or `codebase`.
        kind: SourceKind,

        /// Payload file produced by `dax fetch` (or by hand).
        #[arg(long)]
        input: Option<PathBuf>,

        /// For `codebase`: scan this directory instead of reading a payload.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Index name under `[index].dir` (default: `[index].default`).
        #[arg(long)]
        index: Option<String>,
    },

    /// Merge index files into one. Later inputs win on duplicate ids.
    Merge {
        /// Output index file.
        output: PathBuf,
        /// Input index files, merged left to right.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Search an index.
    Search {
        query: String,
        /// Index name (default: `[index].default`).
        #[arg(long)]
        index: Option<String>,
        /// Maximum number of results.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Chat with retrieval over the default index.
    ///
    /// With `--message`, runs one turn and exits; otherwise reads questions
    /// from stdin until EOF or `exit`.
    Chat {
        /// Resume a saved session by id.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        message: Option<String>,
    },

    /// List or run tools.
    Tools {
        #[command(subcommand)]
        action: ToolAction,
    },

    /// Start the HTTP and MCP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum FetchSource {
    /// Git history via `git log`, from a local checkout or a shallow clone.
    Git {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Clone this remote instead of reading `--repo`.
        #[arg(long)]
        url: Option<String>,
        /// Branch to clone with `--url` (default: the remote's HEAD).
        #[arg(long, requires = "url")]
        branch: Option<String>,
        /// Environment variable holding a GitHub token for private clones.
        #[arg(long, requires = "url")]
        token_env: Option<String>,
        #[arg(long, default_value_t = 100)]
        max_commits: usize,
        #[arg(long, default_value = "./data/git_history.json")]
        output: PathBuf,
    },
    /// JIRA issues matching a JQL query.
    Jira {
        #[arg(long)]
        jql: String,
        #[arg(long, default_value = "./data/jira_tickets.json")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum ToolAction {
    /// List all registered tools.
    List,
    /// Run a tool by name.
    Run {
        name: String,
        /// Tool arguments as `key=value` pairs. Values that parse as JSON
        /// are passed as JSON; anything else is a string.
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
    },
}

/// Parse a `key=value` pair for `--arg` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn args_to_json(args: &[(String, String)]) -> Value {
    let map = args
        .iter()
        .map(|(k, v)| {
            let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()));
            (k.clone(), value)
        })
        .collect();
    Value::Object(map)
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::minimal()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch { source } => run_fetch(&cfg, source).await?,
        Commands::Ingest {
            kind,
            input,
            root,
            index,
        } => run_ingest(&cfg, kind, input, root, index).await?,
        Commands::Merge { output, inputs } => {
            let indexes = inputs
                .iter()
                .map(|p| EmbeddingIndex::load(p))
                .collect::<Result<Vec<_>, _>>()?;
            let merged = EmbeddingIndex::merge_all(indexes)?;
            merged.save(&output)?;
            println!(
                "Merged {} indexes into {} ({} documents)",
                inputs.len(),
                output.display(),
                merged.len()
            );
        }
        Commands::Search {
            query,
            index,
            limit,
        } => {
            let name = index.unwrap_or_else(|| cfg.index.default.clone());
            let path = cfg.index_path(&name);
            let index = EmbeddingIndex::load(&path)
                .with_context(|| format!("Failed to open index '{}'", name))?;
            let embedder = create_embedder(&cfg.embedding)?;
            let hits = index.search(embedder.as_ref(), &query, limit).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.score, hit.document.id);
                let snippet: String = hit.document.text.chars().take(200).collect();
                println!("    {}", snippet.replace('\n', " "));
            }
        }
        Commands::Chat { session, message } => {
            let core = AppCore::from_config(&cfg, session.as_deref())?;
            run_chat(&core, message).await?;
        }
        Commands::Tools { action } => match action {
            ToolAction::List => {
                let registry = build_registry(&cfg)?;
                println!("{:<28} {:<9} DESCRIPTION", "TOOL", "TYPE");
                for tool in registry.list() {
                    let kind = if tool.is_builtin() { "builtin" } else { "custom" };
                    println!("{:<28} {:<9} {}", tool.name(), kind, tool.description());
                }
            }
            ToolAction::Run { name, args } => {
                let core = if needs_session(&name) {
                    AppCore::from_config(&cfg, None)?
                } else {
                    let config = Arc::new(cfg.clone());
                    AppCore::new(config.clone(), build_registry(&cfg)?, tool_context(config)?)
                };
                let result = core.execute_tool(&name, args_to_json(&args)).await?;
                match result {
                    Value::String(s) => println!("{}", s),
                    other => println!("{}", serde_json::to_string_pretty(&other)?),
                }
            }
        },
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

/// Tools that read the index, the chat session, or the generator need the
/// full wiring.
fn needs_session(name: &str) -> bool {
    matches!(
        name,
        "search_knowledge_base" | "question_answering" | "summarize_jira_tickets"
    )
}

/// Context for tools that only need config: no providers are contacted.
fn tool_context(config: Arc<Config>) -> anyhow::Result<ToolContext> {
    let ctx = ToolContext::new(config.clone());
    match server::open_index(&config)? {
        Some(index) => {
            let embedder = create_embedder(&config.embedding)?;
            Ok(ctx.with_index(SharedIndex::new(index), embedder))
        }
        None => Ok(ctx),
    }
}

async fn run_fetch(cfg: &Config, source: FetchSource) -> anyhow::Result<()> {
    match source {
        FetchSource::Git {
            repo,
            url,
            branch,
            token_env,
            max_commits,
            output,
        } => {
            let payload = match url {
                Some(url) => {
                    let token = match token_env {
                        Some(var) => Some(std::env::var(&var).with_context(|| {
                            format!("{} environment variable not set", var)
                        })?),
                        None => None,
                    };
                    sources::fetch_remote_git_history(
                        &url,
                        branch.as_deref(),
                        token.as_deref(),
                        max_commits,
                    )?
                }
                None => sources::fetch_git_history(&repo, max_commits)?,
            };
            sources::write_payload(&output, &payload)?;
            println!(
                "Fetched {} commits to {}",
                payload["metadata"]["total_commits_fetched"],
                output.display()
            );
        }
        FetchSource::Jira { jql, output } => {
            let payload = sources::fetch_jira_tickets(&cfg.jira, &jql).await?;
            sources::write_payload(&output, &payload)?;
            let count = payload["tickets"].as_array().map(|t| t.len()).unwrap_or(0);
            println!("Fetched {} tickets to {}", count, output.display());
        }
    }
    Ok(())
}

async fn run_ingest(
    cfg: &Config,
    kind: SourceKind,
    input: Option<PathBuf>,
    root: Option<PathBuf>,
    index: Option<String>,
) -> anyhow::Result<()> {
    let payload = match (input, root) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read payload: {}", path.display()))?;
            serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("Failed to parse payload: {}", path.display()))?
        }
        (None, Some(root)) if kind == SourceKind::Codebase => {
            let entities = codebase::scan_codebase(
                &root,
                &cfg.codebase.include_globs,
                &cfg.codebase.exclude_globs,
            )?;
            let summary = codebase::summarize(&entities);
            println!(
                "Scanned {}: {} files, {} symbols",
                root.display(),
                summary.files,
                summary.symbols
            );
            codebase::to_payload(&root, &entities)?
        }
        _ => anyhow::bail!("ingest needs --input <payload.json> (or --root <dir> for codebase)"),
    };

    let name = index.unwrap_or_else(|| cfg.index.default.clone());
    let output = cfg.index_path(&name);
    let embedder = create_embedder(&cfg.embedding)?;
    let summary = build_index(
        kind,
        &payload,
        &output,
        embedder.as_ref(),
        cfg.embedding.batch_size,
    )
    .await?;

    println!(
        "Ingested {} {} records into {} ({} documents total)",
        summary.documents_ingested,
        kind.as_str(),
        summary.output_path.display(),
        summary.document_count
    );
    Ok(())
}

async fn run_chat(core: &AppCore, message: Option<String>) -> anyhow::Result<()> {
    let session = core.session()?;

    if let Some(text) = message {
        println!("{}", core.chat(&text).await?);
        return Ok(());
    }

    println!("Session {} (type 'exit' to quit)", session.id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "exit" || text == "quit" {
            break;
        }
        match core.chat(text).await {
            Ok(answer) => println!("{}\n", answer),
            Err(e) => eprintln!("Error: {}\n", e),
        }
    }

    let summary = session.summary().await;
    println!("{} messages in session {}", summary.message_count, summary.session_id);
    Ok(())
}
