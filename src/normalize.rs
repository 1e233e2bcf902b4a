//! Document normalizer.
//!
//! Converts a heterogeneous raw record (JIRA ticket, git commit, codebase
//! entity) into a uniform [`Document`]. Normalization never fails: missing
//! or mistyped fields render as empty strings so one malformed record cannot
//! abort an ingest batch. Shape validation happens earlier, in
//! [`crate::ingest::validate_payload`].

use serde_json::Value;

use crate::models::{Document, MetadataValue, SourceKind};

/// Normalize one raw record of the given kind.
pub fn normalize(kind: SourceKind, record: &Value) -> Document {
    match kind {
        SourceKind::Jira => normalize_jira(record),
        SourceKind::Git => normalize_commit(record),
        SourceKind::Codebase => normalize_entity(record),
    }
}

/// Render a field as text. Strings are used verbatim, numbers and booleans
/// are formatted, everything else is empty.
fn field(record: &Value, key: &str) -> String {
    match record.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// The ticket key. JIRA exports use `key`; the prototype payloads used `id`.
pub(crate) fn jira_key(record: &Value) -> String {
    let key = field(record, "key");
    if key.is_empty() {
        field(record, "id")
    } else {
        key
    }
}

fn normalize_jira(record: &Value) -> Document {
    let key = jira_key(record);
    let text = format!(
        "ID: {}\nSummary: {}\nDescription: {}",
        key,
        field(record, "summary"),
        field(record, "description")
    );
    Document::new(key.clone(), text).with_meta("id", key)
}

fn normalize_commit(record: &Value) -> Document {
    let sha = field(record, "sha");
    let short_sha = match field(record, "short_sha") {
        s if s.is_empty() => sha.chars().take(7).collect(),
        s => s,
    };

    let author = record.get("author").cloned().unwrap_or(Value::Null);
    // Older payloads store the author as a plain string.
    let (author_name, author_email) = match &author {
        Value::String(s) => (s.clone(), String::new()),
        other => (field(other, "name"), field(other, "email")),
    };

    let changed_files = record
        .get("changed_files")
        .and_then(|f| f.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let authored = field(record, "authored_date");
    let committed = field(record, "committed_date");

    let text = format!(
        "Commit: {}\nMessage: {}\nAuthor: {} <{}>\nAuthored: {}\nCommitted: {}\nChanged files: {}",
        sha,
        field(record, "message"),
        author_name,
        author_email,
        authored,
        committed,
        changed_files
    );

    Document::new(sha.clone(), text)
        .with_meta("sha", sha)
        .with_meta("short_sha", short_sha)
        .with_meta("author", author_name)
        .with_meta("authored_date", authored)
        .with_meta("committed_date", committed)
}

/// Composite id for a codebase entity.
///
/// Whole-file records are keyed by path; symbols by path, kind, name, and
/// line so two `main` functions in different files (or the same file) do
/// not collide.
pub fn entity_id(kind: &str, name: &str, file_path: &str, line: Option<u64>) -> String {
    if kind == "file" {
        return file_path.to_string();
    }
    match line {
        Some(line) => format!("{}::{}:{}@{}", file_path, kind, name, line),
        None => format!("{}::{}:{}", file_path, kind, name),
    }
}

fn normalize_entity(record: &Value) -> Document {
    let kind = field(record, "type");
    let name = field(record, "name");
    let file_path = field(record, "file_path");
    let line = record.get("line").and_then(|l| l.as_u64());

    let id = match field(record, "id") {
        s if s.is_empty() => entity_id(&kind, &name, &file_path, line),
        s => s,
    };

    let mut body = field(record, "doc");
    let content = field(record, "content");
    if !content.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&content);
    }

    let text = format!(
        "Type: {}\nName: {}\nFile: {}\nContent: {}",
        kind, name, file_path, body
    );

    let mut doc = Document::new(id, text)
        .with_meta("type", kind)
        .with_meta("name", name)
        .with_meta("file_path", file_path);
    if let Some(line) = line {
        doc.metadata
            .insert("line".to_string(), MetadataValue::Number(line.into()));
    }
    doc
}
