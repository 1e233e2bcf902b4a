//! Error taxonomy shared by the index, ingest pipeline, chat session, and
//! tool dispatcher.
//!
//! Every variant is recovered at the component boundary that detects it and
//! returned to the caller as a value. Nothing here is meant to terminate the
//! host process; the HTTP layer maps each variant to a status code.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Ingest input is missing a required field. Caller or config bug; not retried.
    #[error("invalid payload: missing required field `{0}`")]
    InvalidPayload(String),

    /// The embedding collaborator failed (rate limit, network, auth, bad response).
    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    /// The text-generation collaborator failed after all retries.
    #[error("generation error: {0}")]
    Generation(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model mismatch: index was built with '{index}', query uses '{query}'")]
    ModelMismatch { index: String, query: String },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{name}' failed: {cause}")]
    ToolExecution { name: String, cause: String },

    /// Only produced by the non-queueing [`crate::chat::ChatSession::try_chat`].
    #[error("session is busy with another turn")]
    SessionBusy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPayload(_) => "invalid_payload",
            Error::EmbeddingBackend(_) => "embedding_backend",
            Error::Generation(_) => "generation",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::ModelMismatch { .. } => "model_mismatch",
            Error::CorruptIndex(_) => "corrupt_index",
            Error::ToolNotFound(_) => "not_found",
            Error::ToolExecution { .. } => "tool_error",
            Error::SessionBusy => "busy",
            Error::Config(_) => "config",
            Error::Io(_) | Error::Serialization(_) => "internal",
        }
    }

    /// Transient collaborator failures; everything else is a caller or data fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::EmbeddingBackend(_) | Error::Generation(_))
    }
}
