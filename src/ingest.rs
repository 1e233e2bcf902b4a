//! Ingestion pipeline orchestration.
//!
//! Coordinates the build flow for one raw payload:
//! validate shape → normalize → load-or-create index → embed + add → save.
//!
//! Payload shapes by source kind:
//!
//! | kind | top-level | required per record |
//! |---|---|---|
//! | `jira` | `tickets` | `key` (or `id`) |
//! | `git` | `commits` | `sha` |
//! | `codebase` | `entities` | `type`, `name`, `file_path` |

use serde_json::Value;
use std::path::Path;

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::index::EmbeddingIndex;
use crate::models::{Document, IndexSummary, SourceKind};
use crate::normalize::{jira_key, normalize};

fn records_key(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Jira => "tickets",
        SourceKind::Git => "commits",
        SourceKind::Codebase => "entities",
    }
}

fn required_fields(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Jira => &["key"],
        SourceKind::Git => &["sha"],
        SourceKind::Codebase => &["type", "name", "file_path"],
    }
}

fn has_text(record: &Value, field: &str) -> bool {
    match record.get(field) {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(_)) => true,
        _ => false,
    }
}

/// Check that `payload` has the shape `kind` expects.
///
/// The error names the first offending path, e.g. `tickets[2].key`.
pub fn validate_payload(kind: SourceKind, payload: &Value) -> Result<&[Value]> {
    let key = records_key(kind);
    let records = payload
        .get(key)
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::InvalidPayload(key.to_string()))?;

    for (i, record) in records.iter().enumerate() {
        if !record.is_object() {
            return Err(Error::InvalidPayload(format!("{}[{}]", key, i)));
        }
        for field in required_fields(kind) {
            let present = match (kind, *field) {
                (SourceKind::Jira, "key") => !jira_key(record).is_empty(),
                _ => has_text(record, field),
            };
            if !present {
                return Err(Error::InvalidPayload(format!("{}[{}].{}", key, i, field)));
            }
        }
    }

    Ok(records)
}

/// Validate and normalize every record of a payload.
pub fn normalize_payload(kind: SourceKind, payload: &Value) -> Result<Vec<Document>> {
    let records = validate_payload(kind, payload)?;
    Ok(records.iter().map(|r| normalize(kind, r)).collect())
}

/// Ingest one payload into the index at `output_path`.
///
/// An existing index file is loaded and extended; otherwise a new index is
/// created for `embedder`. Nothing is written if validation or embedding
/// fails, if the embedder is disabled, or if an empty payload would only
/// create a new empty file.
pub async fn build_index(
    kind: SourceKind,
    payload: &Value,
    output_path: &Path,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<IndexSummary> {
    let documents = normalize_payload(kind, payload)?;
    let documents_ingested = documents.len();

    // A zero-dimension index would be stamped with the disabled model and
    // reject every later ingest.
    if embedder.dims() == 0 {
        return Err(Error::EmbeddingBackend(format!(
            "embedding provider '{}' cannot build an index; set [embedding].provider in the config",
            embedder.model_name()
        )));
    }

    let exists = output_path.exists();
    if documents.is_empty() && !exists {
        tracing::info!(kind = kind.as_str(), path = %output_path.display(), "empty payload, nothing to write");
        return Ok(IndexSummary {
            document_count: 0,
            documents_ingested: 0,
            output_path: output_path.to_path_buf(),
        });
    }

    let mut index = if exists {
        EmbeddingIndex::load(output_path)?
    } else {
        EmbeddingIndex::for_embedder(embedder)
    };

    index.add(embedder, documents, batch_size).await?;
    index.save(output_path)?;

    tracing::info!(
        kind = kind.as_str(),
        ingested = documents_ingested,
        total = index.len(),
        path = %output_path.display(),
        "ingest complete"
    );

    Ok(IndexSummary {
        document_count: index.len(),
        documents_ingested,
        output_path: output_path.to_path_buf(),
    })
}
