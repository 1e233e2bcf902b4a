//! HTTP front-end.
//!
//! Exposes the chat session and the tool registry over a JSON HTTP API,
//! plus an MCP Streamable HTTP endpoint for MCP clients.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call any registered tool by name |
//! | `POST` | `/chat` | One chat turn: `{"message": ...}` → `{"response": ...}` |
//! | `GET`  | `/chat/session` | Session id, creation time, and message count |
//! | `*`    | `/mcp` | MCP JSON-RPC over Streamable HTTP (`tools/list`, `tools/call`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "tool not found: nope" } }
//! ```
//!
//! | code | status |
//! |---|---|
//! | `bad_request`, `invalid_payload` | 400 |
//! | `not_found` | 404 |
//! | `busy`, `dimension_mismatch`, `model_mismatch` | 409 |
//! | `embedding_backend`, `generation` | 502 |
//! | `tool_error`, `corrupt_index`, `config`, `internal` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{
    ChatOptions, ChatSession, HistoryStore, Retriever, SessionSummary, SessionTools,
};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::Error;
use crate::generation::create_generator;
use crate::index::{EmbeddingIndex, SharedIndex};
use crate::mcp::McpBridge;
use crate::tools::build_registry;
use crate::traits::{ToolContext, ToolRegistry};

/// The front-end boundary: one chat session plus the tool registry.
///
/// Shared by the HTTP handlers, the MCP bridge, and the CLI.
#[derive(Clone)]
pub struct AppCore {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub context: Arc<ToolContext>,
}

impl AppCore {
    pub fn new(config: Arc<Config>, tools: ToolRegistry, context: ToolContext) -> Self {
        Self {
            config,
            tools: Arc::new(tools),
            context: Arc::new(context),
        }
    }

    /// Wire providers, indexes, the chat session, and tools from `config`.
    ///
    /// `session_id` resumes a saved conversation; `None` starts a new one.
    /// The session may call every registered tool; its tool context has no
    /// session, so `question_answering` reports an error there instead of
    /// waiting on the turn that called it.
    pub fn from_config(config: &Config, session_id: Option<&str>) -> anyhow::Result<Self> {
        let config = Arc::new(config.clone());
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let options = ChatOptions::from_config(&config);
        let store = HistoryStore::new(config.chat.sessions_dir.clone());

        let session = match session_id {
            Some(id) => ChatSession::resume(id, generator.clone(), options, store)?,
            None => ChatSession::new(generator.clone(), options).with_store(store),
        };

        let mut context = ToolContext::new(config.clone()).with_generator(generator);
        let session = match open_index(&config)? {
            Some(index) => {
                let shared = SharedIndex::new(index);
                context = context.with_index(shared.clone(), embedder.clone());
                session.with_retriever(Retriever::new(shared, embedder))
            }
            None => {
                tracing::warn!("no index found; chat runs without retrieval");
                session
            }
        };

        let tools = Arc::new(build_registry(&config)?);
        let session =
            session.with_tools(SessionTools::new(tools.clone(), Arc::new(context.clone())));
        let context = context.with_session(Arc::new(session));

        Ok(Self {
            config,
            tools,
            context: Arc::new(context),
        })
    }

    pub fn session(&self) -> crate::error::Result<&Arc<ChatSession>> {
        self.context
            .session
            .as_ref()
            .ok_or_else(|| Error::Config("no chat session configured".to_string()))
    }

    pub async fn chat(&self, text: &str) -> crate::error::Result<String> {
        self.session()?.chat(text).await
    }

    pub async fn execute_tool(&self, name: &str, args: Value) -> crate::error::Result<Value> {
        self.tools.execute(name, args, self.context.clone()).await
    }
}

/// Load the default index and merge any `index.merge` indexes into it,
/// left to right. Missing files are skipped; `None` if none exist.
pub fn open_index(config: &Config) -> crate::error::Result<Option<EmbeddingIndex>> {
    let names = std::iter::once(&config.index.default).chain(config.index.merge.iter());
    let mut loaded = Vec::new();
    for name in names {
        let path = config.index_path(name);
        if path.exists() {
            loaded.push(EmbeddingIndex::load(&path)?);
        } else {
            tracing::debug!(path = %path.display(), "index file not found, skipping");
        }
    }
    if loaded.is_empty() {
        return Ok(None);
    }
    EmbeddingIndex::merge_all(loaded).map(Some)
}

/// Build the router for `core`. Exposed for embedding and tests.
pub fn build_router(core: AppCore) -> Router {
    let bridge = McpBridge::new(core.tools.clone(), core.context.clone());
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/chat", post(handle_chat))
        .route("/chat/session", get(handle_session))
        .nest_service("/mcp", mcp_service)
        .layer(cors)
        .with_state(core)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let core = AppCore::from_config(config, None)?;
    let bind_addr = config.server.bind.clone();

    println!("Registered {} tools:", core.tools.len());
    for t in core.tools.list() {
        println!("  POST /tools/{}  {}", t.name(), t.description());
    }

    let app = build_router(core);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Server listening on http://{}", bind_addr);
    println!("MCP endpoint: http://{}/mcp", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Error::ToolExecution { cause, .. } if cause.starts_with("invalid arguments") => {
                StatusCode::BAD_REQUEST
            }
            Error::ToolNotFound(_) => StatusCode::NOT_FOUND,
            Error::SessionBusy | Error::DimensionMismatch { .. } | Error::ModelMismatch { .. } => {
                StatusCode::CONFLICT
            }
            Error::EmbeddingBackend(_) | Error::Generation(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = if status == StatusCode::BAD_REQUEST && err.code() == "tool_error" {
            "bad_request"
        } else {
            err.code()
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(core): State<AppCore>) -> Json<ToolListResponse> {
    let tools = core
        .tools
        .list()
        .iter()
        .map(|t| ToolInfo {
            name: t.name().to_string(),
            description: t.description().to_string(),
            builtin: t.is_builtin(),
            parameters: t.parameters_schema(),
        })
        .collect();
    Json(ToolListResponse { tools })
}

async fn handle_tool_call(
    State(core): State<AppCore>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let result = core.execute_tool(&name, params).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    session_id: String,
}

async fn handle_chat(
    State(core): State<AppCore>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let session = core.session()?;
    let response = session.chat(&request.message).await?;
    Ok(Json(ChatResponse {
        response,
        session_id: session.id().to_string(),
    }))
}

async fn handle_session(State(core): State<AppCore>) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(core.session()?.summary().await))
}
