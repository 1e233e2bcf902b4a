//! Retrieval-augmented chat session.
//!
//! A [`ChatSession`] owns one conversation. Each [`ChatSession::chat`] call:
//!
//! 1. appends the user turn,
//! 2. retrieves the top `chat.top_k` documents for the user text,
//! 3. builds a [`Prompt`] from the system instructions, the last
//!    `chat.history_window` turns, the rendered context, and the user text,
//! 4. calls the generator (retrying up to `generation.max_retries` extra
//!    times); when tools are attached the model may request tool calls,
//!    which run through the [`ToolRegistry`] and are fed back for up to
//!    `chat.max_tool_rounds` rounds before a text answer is required,
//! 5. appends the assistant turn and persists the history.
//!
//! If retrieval, generation, or saving fails the in-memory history is left
//! as it was, so it never ends with an unanswered question.
//!
//! Concurrent calls on one session queue up in arrival order behind a fair
//! `tokio::sync::Mutex`. [`ChatSession::try_chat`] is the non-queueing
//! variant and fails with [`Error::SessionBusy`] instead of waiting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::generation::{Completion, Generator, Prompt, ToolCall, ToolExchange};
use crate::index::SharedIndex;
use crate::models::{SearchHit, Turn};
use crate::traits::{ToolContext, ToolRegistry};

/// Smallest snippet any retrieved hit gets, even when the context budget is
/// split many ways.
pub const MIN_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub system_prompt: String,
    pub top_k: usize,
    pub context_char_limit: usize,
    pub history_window: usize,
    pub max_retries: u32,
    pub max_tool_rounds: usize,
}

impl ChatOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.chat.system_prompt.clone(),
            top_k: config.chat.top_k,
            context_char_limit: config.chat.context_char_limit,
            history_window: config.chat.history_window,
            max_retries: config.generation.max_retries,
            max_tool_rounds: config.chat.max_tool_rounds,
        }
    }
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from_config(&Config::minimal())
    }
}

/// Index plus the embedder that built it.
#[derive(Clone)]
pub struct Retriever {
    pub index: SharedIndex,
    pub embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(index: SharedIndex, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        self.index.search(self.embedder.as_ref(), query, k).await
    }
}

/// Tools the model may call during a turn, with the context they run in.
#[derive(Clone)]
pub struct SessionTools {
    pub registry: Arc<ToolRegistry>,
    pub context: Arc<ToolContext>,
}

impl SessionTools {
    pub fn new(registry: Arc<ToolRegistry>, context: Arc<ToolContext>) -> Self {
        Self { registry, context }
    }

    /// Run one requested call. Failures become text for the model rather
    /// than failing the turn.
    async fn run(&self, session_id: &str, call: &ToolCall) -> String {
        tracing::info!(session = %session_id, tool = %call.name, "model requested tool");
        match self
            .registry
            .execute(&call.name, call.arguments.clone(), self.context.clone())
            .await
        {
            Ok(Value::String(text)) => text,
            Ok(other) => other.to_string(),
            Err(e) => {
                tracing::warn!(session = %session_id, tool = %call.name, error = %e, "tool call failed");
                format!("error: {}", e)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    AwaitingCompletion,
}

/// Metadata about a session, as shown by `dax chat` and the server.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub status: SessionStatus,
}

/// Conversation files under a directory, one flat JSON array per session.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Load a session's turns; a missing file is an empty history.
    pub fn load(&self, session_id: &str) -> Result<Vec<Turn>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Overwrite a session's file atomically.
    pub fn save(&self, session_id: &str, turns: &[Turn]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(turns)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub struct ChatSession {
    id: String,
    created_at: DateTime<Utc>,
    options: ChatOptions,
    generator: Arc<dyn Generator>,
    retriever: Option<Retriever>,
    tools: Option<SessionTools>,
    store: Option<HistoryStore>,
    history: Mutex<Vec<Turn>>,
    pending: AtomicUsize,
}

/// Decrements the pending-call counter when a `chat` call finishes or is
/// dropped mid-flight.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChatSession {
    /// A fresh in-memory session with a random id.
    pub fn new(generator: Arc<dyn Generator>, options: ChatOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            options,
            generator,
            retriever: None,
            tools: None,
            store: None,
            history: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Open session `id` backed by `store`, loading any saved turns.
    pub fn resume(
        id: impl Into<String>,
        generator: Arc<dyn Generator>,
        options: ChatOptions,
        store: HistoryStore,
    ) -> Result<Self> {
        let id = id.into();
        let turns = store.load(&id)?;
        let mut session = Self::new(generator, options);
        session.id = id;
        session.history = Mutex::new(turns);
        session.store = Some(store);
        Ok(session)
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_tools(mut self, tools: SessionTools) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_store(mut self, store: HistoryStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        if self.pending.load(Ordering::SeqCst) > 0 {
            SessionStatus::AwaitingCompletion
        } else {
            SessionStatus::Idle
        }
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> Vec<Turn> {
        self.history.lock().await.clone()
    }

    pub async fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            created_at: self.created_at,
            message_count: self.history.lock().await.len(),
            status: self.status(),
        }
    }

    /// Run one turn, waiting behind any turn already in progress.
    pub async fn chat(&self, user_text: &str) -> Result<String> {
        let _pending = PendingGuard::enter(&self.pending);
        let mut history = self.history.lock().await;
        self.run_turn(&mut history, user_text).await
    }

    /// Run one turn only if the session is idle.
    pub async fn try_chat(&self, user_text: &str) -> Result<String> {
        let mut history = self.history.try_lock().map_err(|_| Error::SessionBusy)?;
        let _pending = PendingGuard::enter(&self.pending);
        self.run_turn(&mut history, user_text).await
    }

    /// History is only replaced once the answer exists and, with a store,
    /// has been saved.
    async fn run_turn(&self, history: &mut Vec<Turn>, user_text: &str) -> Result<String> {
        let mut candidate = history.clone();
        candidate.push(Turn::user(user_text));

        let answer = self.answer(&candidate, user_text).await?;
        candidate.push(Turn::assistant(answer.clone()));
        if let Some(store) = &self.store {
            store.save(&self.id, &candidate)?;
        }

        *history = candidate;
        Ok(answer)
    }

    async fn answer(&self, history: &[Turn], user_text: &str) -> Result<String> {
        let context = match &self.retriever {
            Some(retriever) => {
                let hits = retriever.retrieve(user_text, self.options.top_k).await?;
                tracing::debug!(session = %self.id, hits = hits.len(), "retrieved context");
                render_context(&hits, self.options.context_char_limit)
            }
            None => String::new(),
        };

        // The user turn just appended is sent separately, with the context.
        let earlier = &history[..history.len().saturating_sub(1)];
        let window_start = earlier.len().saturating_sub(self.options.history_window);

        let mut prompt = Prompt {
            system: self.options.system_prompt.clone(),
            history: earlier[window_start..].to_vec(),
            context,
            user: user_text.to_string(),
            tools: Vec::new(),
            tool_exchanges: Vec::new(),
        };

        let max_rounds = match &self.tools {
            Some(tools) if self.options.max_tool_rounds > 0 => {
                prompt.tools = tools.registry.definitions();
                self.options.max_tool_rounds
            }
            _ => 0,
        };

        let mut rounds = 0;
        loop {
            // The last round offers no tools, so the model has to answer.
            if rounds == max_rounds {
                prompt.tools.clear();
            }
            match self.generate(&prompt).await? {
                Completion::Text(text) => return Ok(text),
                Completion::ToolCalls(_) if prompt.tools.is_empty() => {
                    return Err(Error::Generation(format!(
                        "model requested tools after {} tool rounds",
                        max_rounds
                    )));
                }
                Completion::ToolCalls(calls) => {
                    if let Some(tools) = &self.tools {
                        for call in calls {
                            let result = tools.run(&self.id, &call).await;
                            prompt.tool_exchanges.push(ToolExchange { call, result });
                        }
                    }
                    rounds += 1;
                }
            }
        }
    }

    async fn generate(&self, prompt: &Prompt) -> Result<Completion> {
        let attempts = self.options.max_retries + 1;
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            match self.generator.complete_with_tools(prompt).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    last_err = format!("{:#}", e);
                    tracing::warn!(
                        session = %self.id,
                        attempt,
                        attempts,
                        error = %last_err,
                        "generation failed"
                    );
                }
            }
        }

        Err(Error::Generation(last_err))
    }
}

/// Render search hits as a numbered context block.
///
/// The budget is split evenly across hits, with a floor of
/// [`MIN_SNIPPET_CHARS`] per hit so no hit is dropped entirely.
pub fn render_context(hits: &[SearchHit], char_limit: usize) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let per_hit = (char_limit / hits.len()).max(MIN_SNIPPET_CHARS);

    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "[{}] {} (score {:.3})\n{}",
                i + 1,
                hit.document.id,
                hit.score,
                truncate_chars(&hit.document.text, per_hit)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::EmbeddingIndex;
    use crate::models::{Document, Role};
    use crate::tools::builtin_registry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Fails the first `failures` calls, then answers with a counter.
    struct Scripted {
        failures: usize,
        calls: AtomicUsize,
        prompts: StdMutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                prompts: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, prompt: &Prompt) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.clone());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("upstream 503");
            }
            Ok(format!("answer to {}", prompt.user))
        }
    }

    /// Blocks until released.
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Generator for Gate {
        fn model_name(&self) -> &str {
            "gate"
        }
        async fn complete(&self, prompt: &Prompt) -> anyhow::Result<String> {
            self.0.notified().await;
            Ok(prompt.user.clone())
        }
    }

    /// Asks for `check_git_conventions` until `calls_wanted` rounds have run,
    /// then answers with the last tool result.
    struct ToolCaller {
        calls_wanted: usize,
        prompts: StdMutex<Vec<Prompt>>,
    }

    impl ToolCaller {
        fn new(calls_wanted: usize) -> Arc<Self> {
            Arc::new(Self {
                calls_wanted,
                prompts: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for ToolCaller {
        fn model_name(&self) -> &str {
            "tool-caller"
        }
        async fn complete(&self, _prompt: &Prompt) -> anyhow::Result<String> {
            anyhow::bail!("text-only path not used")
        }
        async fn complete_with_tools(&self, prompt: &Prompt) -> anyhow::Result<Completion> {
            self.prompts.lock().unwrap().push(prompt.clone());
            let done = prompt.tool_exchanges.len();
            if !prompt.tools.is_empty() && done < self.calls_wanted {
                return Ok(Completion::ToolCalls(vec![ToolCall {
                    id: format!("call_{}", done),
                    name: "check_git_conventions".into(),
                    arguments: json!({"query": "demo"}),
                }]));
            }
            match prompt.tool_exchanges.last() {
                Some(exchange) => Ok(Completion::Text(format!("Tool said: {}", exchange.result))),
                None if self.calls_wanted > 0 => Ok(Completion::ToolCalls(Vec::new())),
                None => Ok(Completion::Text("no tools".into())),
            }
        }
    }

    fn session_tools() -> SessionTools {
        SessionTools::new(
            Arc::new(builtin_registry()),
            Arc::new(ToolContext::new(Arc::new(Config::minimal()))),
        )
    }

    fn options(max_retries: u32) -> ChatOptions {
        ChatOptions {
            max_retries,
            ..ChatOptions::default()
        }
    }

    #[tokio::test]
    async fn test_chat_appends_turns() {
        let session = ChatSession::new(Scripted::new(0), options(0));
        assert_eq!(session.status(), SessionStatus::Idle);

        let answer = session.chat("hello").await.unwrap();
        assert_eq!(answer, "answer to hello");

        let history = session.history().await;
        assert_eq!(history, vec![Turn::user("hello"), Turn::assistant(answer)]);
        assert_eq!(session.summary().await.message_count, 2);
    }

    #[tokio::test]
    async fn test_model_tool_call_result_reaches_final_prompt() {
        let generator = ToolCaller::new(1);
        let session = ChatSession::new(generator.clone(), options(0)).with_tools(session_tools());

        let answer = session.chat("what commit style do we use?").await.unwrap();
        assert!(answer.contains("demo data"));

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].tools.iter().any(|t| t.name == "check_git_conventions"));
        let exchange = &prompts[1].tool_exchanges[0];
        assert_eq!(exchange.call.name, "check_git_conventions");
        assert!(exchange.result.contains("Conventional commit format"));

        // Only the user question and final answer are kept.
        assert_eq!(session.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let generator = ToolCaller::new(usize::MAX);
        let session = ChatSession::new(
            generator.clone(),
            ChatOptions {
                max_tool_rounds: 2,
                ..options(0)
            },
        )
        .with_tools(session_tools());

        let answer = session.chat("loop forever").await.unwrap();
        assert!(answer.starts_with("Tool said:"));

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[2].tool_exchanges.len(), 2);
        assert!(prompts[2].tools.is_empty());
    }

    #[tokio::test]
    async fn test_zero_tool_rounds_sends_no_tools() {
        let generator = ToolCaller::new(1);
        let session = ChatSession::new(
            generator.clone(),
            ChatOptions {
                max_tool_rounds: 0,
                ..options(0)
            },
        )
        .with_tools(session_tools());

        let err = session.chat("hi").await.unwrap_err();
        assert!(matches!(err, Error::Generation(msg) if msg.contains("0 tool rounds")));
        assert!(generator.prompts.lock().unwrap()[0].tools.is_empty());
        assert!(session.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_generation_retries_then_succeeds() {
        let generator = Scripted::new(2);
        let session = ChatSession::new(generator.clone(), options(2));
        assert!(session.chat("q").await.is_ok());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_generation_failure_rolls_back_user_turn() {
        let generator = Scripted::new(usize::MAX);
        let session = ChatSession::new(generator.clone(), options(2));
        session.chat("first").await.unwrap_err();

        let err = session.chat("second").await.unwrap_err();
        assert!(matches!(err, Error::Generation(msg) if msg.contains("503")));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 6);
        assert!(session.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_carries_window_and_context() {
        let embedder = Arc::new(HashEmbedder::new(1024));
        let mut index = EmbeddingIndex::for_embedder(embedder.as_ref());
        index
            .add(
                embedder.as_ref(),
                vec![
                    Document::new("TK-1", "ID: TK-1\nSummary: Fix login bug"),
                    Document::new("TK-2", "ID: TK-2\nSummary: Add dark mode"),
                ],
                8,
            )
            .await
            .unwrap();

        let generator = Scripted::new(0);
        let session = ChatSession::new(
            generator.clone(),
            ChatOptions {
                top_k: 1,
                history_window: 2,
                ..options(0)
            },
        )
        .with_retriever(Retriever::new(SharedIndex::new(index), embedder));

        session.chat("one").await.unwrap();
        session.chat("two").await.unwrap();
        session.chat("login problems").await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert_eq!(last.history.len(), 2);
        assert_eq!(last.history[0], Turn::user("two"));
        assert!(last.context.contains("TK-1"));
        assert!(!last.context.contains("TK-2"));
    }

    #[tokio::test]
    async fn test_concurrent_chats_are_serialized() {
        let session = Arc::new(ChatSession::new(Scripted::new(0), options(0)));
        let a = tokio::spawn({
            let s = session.clone();
            async move { s.chat("a").await }
        });
        let b = tokio::spawn({
            let s = session.clone();
            async move { s.chat("b").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let history = session.history().await;
        assert_eq!(history.len(), 4);
        for pair in history.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert!(pair[1].content.ends_with(&pair[0].content));
        }
    }

    #[tokio::test]
    async fn test_try_chat_reports_busy() {
        let gate = Arc::new(Notify::new());
        let session = Arc::new(ChatSession::new(
            Arc::new(Gate(gate.clone())),
            options(0),
        ));

        let running = tokio::spawn({
            let s = session.clone();
            async move { s.chat("slow").await }
        });
        while session.status() != SessionStatus::AwaitingCompletion {
            tokio::task::yield_now().await;
        }
        // Let the first call take the lock.
        while session.history.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        let err = session.try_chat("fast").await.unwrap_err();
        assert!(matches!(err, Error::SessionBusy));

        gate.notify_one();
        assert_eq!(running.await.unwrap().unwrap(), "slow");
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_history_persists_and_resumes() {
        let tmp = TempDir::new().unwrap();
        let store = HistoryStore::new(tmp.path().join("sessions"));

        let session = ChatSession::resume("abc", Scripted::new(0), options(0), store.clone())
            .unwrap();
        session.chat("hello").await.unwrap();

        let raw = std::fs::read_to_string(store.path_for("abc")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["role"], "user");

        let resumed = ChatSession::resume("abc", Scripted::new(0), options(0), store).unwrap();
        assert_eq!(resumed.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_history_unchanged() {
        let tmp = TempDir::new().unwrap();
        let blocked = tmp.path().join("sessions");
        std::fs::write(&blocked, "not a directory").unwrap();

        let session = ChatSession::new(Scripted::new(0), options(0))
            .with_store(HistoryStore::new(&blocked));
        assert!(session.chat("hello").await.is_err());
        assert!(session.history().await.is_empty());
    }

    #[test]
    fn test_render_context_gives_every_hit_a_snippet() {
        let long = "x".repeat(5000);
        let hits: Vec<SearchHit> = (0..4)
            .map(|i| SearchHit {
                document: Document::new(format!("D-{}", i), long.clone()),
                score: 0.5,
            })
            .collect();

        let rendered = render_context(&hits, 1000);
        for i in 0..4 {
            assert!(rendered.contains(&format!("D-{}", i)));
        }
        assert!(rendered.len() < 4 * (MIN_SNIPPET_CHARS.max(250) + 40));
        assert_eq!(render_context(&[], 1000), "");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
