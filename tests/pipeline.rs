//! End-to-end flows through the library API: ingest → index → search →
//! chat, with the offline hash embedder and echo generator.

use dev_assistant::chat::{ChatOptions, ChatSession, HistoryStore, Retriever};
use dev_assistant::codebase::{scan_codebase, to_payload};
use dev_assistant::config::Config;
use dev_assistant::embedding::{Embedder, HashEmbedder};
use dev_assistant::generation::EchoGenerator;
use dev_assistant::index::{EmbeddingIndex, SharedIndex};
use dev_assistant::ingest::build_index;
use dev_assistant::models::{Document, SourceKind};
use dev_assistant::Error;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn tickets() -> serde_json::Value {
    json!({"tickets": [
        {"key": "TK-1", "summary": "Fix login bug", "description": "SSO redirect loops forever"},
        {"key": "TK-2", "summary": "Add dark mode", "description": "Theme toggle in settings"}
    ]})
}

#[tokio::test]
async fn test_jira_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("jira.idx");
    let embedder = HashEmbedder::new(1024);

    let summary = build_index(SourceKind::Jira, &tickets(), &path, &embedder, 64)
        .await
        .unwrap();
    assert_eq!(summary.document_count, 2);

    let index = EmbeddingIndex::load(&path).unwrap();
    let hits = index.search(&embedder, "login", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document.id, "TK-1");
    assert!(hits[0].document.text.starts_with("ID: TK-1\nSummary: Fix login bug"));
}

#[tokio::test]
async fn test_reingest_overwrites_in_place() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("jira.idx");
    let embedder = HashEmbedder::new(256);

    build_index(SourceKind::Jira, &tickets(), &path, &embedder, 64)
        .await
        .unwrap();
    let updated = json!({"tickets": [
        {"key": "TK-1", "summary": "Fix login bug", "description": "Fixed by clearing cookies"}
    ]});
    let summary = build_index(SourceKind::Jira, &updated, &path, &embedder, 64)
        .await
        .unwrap();
    assert_eq!(summary.document_count, 2);

    let index = EmbeddingIndex::load(&path).unwrap();
    assert_eq!(index.entries()[0].document.id, "TK-1");
    assert!(index.entries()[0].document.text.contains("clearing cookies"));
    assert_eq!(index.entries()[1].document.id, "TK-2");
}

#[tokio::test]
async fn test_merge_of_disjoint_indexes_is_associative() {
    let embedder = HashEmbedder::new(64);
    let mut parts = Vec::new();
    for ids in [["a1", "a2"], ["b1", "b2"], ["c1", "c2"]] {
        let mut index = EmbeddingIndex::for_embedder(&embedder);
        let docs = ids.iter().map(|id| Document::new(*id, format!("doc {}", id))).collect();
        index.add(&embedder, docs, 8).await.unwrap();
        parts.push(index);
    }

    let mut left = parts[0].clone();
    left.merge(&parts[1]).unwrap();
    left.merge(&parts[2]).unwrap();

    let mut right_tail = parts[1].clone();
    right_tail.merge(&parts[2]).unwrap();
    let mut right = parts[0].clone();
    right.merge(&right_tail).unwrap();

    let ids = |i: &EmbeddingIndex| -> Vec<String> {
        i.entries().iter().map(|e| e.document.id.clone()).collect()
    };
    assert_eq!(ids(&left), ids(&right));
    assert_eq!(left.len(), 6);
    assert_eq!(
        left.search(&embedder, "doc b2", 6).await.unwrap(),
        right.search(&embedder, "doc b2", 6).await.unwrap()
    );
}

#[tokio::test]
async fn test_merge_rejects_other_dimension() {
    let small = HashEmbedder::new(8);
    let large = HashEmbedder::new(16);
    let mut a = EmbeddingIndex::new(small.dims(), "");
    a.add(&small, vec![Document::new("x", "x")], 8).await.unwrap();
    let mut b = EmbeddingIndex::new(large.dims(), "");
    b.add(&large, vec![Document::new("y", "y")], 8).await.unwrap();

    let before = a.clone();
    let err = a.merge(&b).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 8, actual: 16 }));
    assert_eq!(a, before);
}

#[tokio::test]
async fn test_codebase_scan_ingest_search() {
    let repo = TempDir::new().unwrap();
    std::fs::create_dir_all(repo.path().join("src")).unwrap();
    std::fs::write(
        repo.path().join("src/cache.rs"),
        "/// Least-recently-used cache.\npub struct LruCache {\n    cap: usize,\n}\n",
    )
    .unwrap();
    std::fs::write(
        repo.path().join("src/billing.py"),
        "def compute_invoice_total(items):\n    return sum(items)\n",
    )
    .unwrap();

    let config = Config::minimal();
    let entities = scan_codebase(
        repo.path(),
        &config.codebase.include_globs,
        &config.codebase.exclude_globs,
    )
    .unwrap();
    let payload = to_payload(repo.path(), &entities).unwrap();

    let out = TempDir::new().unwrap();
    let path = out.path().join("code.idx");
    let embedder = HashEmbedder::new(1024);
    let summary = build_index(SourceKind::Codebase, &payload, &path, &embedder, 16)
        .await
        .unwrap();
    assert_eq!(summary.document_count, entities.len());

    let index = EmbeddingIndex::load(&path).unwrap();
    let hits = index
        .search(&embedder, "compute invoice total", 1)
        .await
        .unwrap();
    assert!(hits[0].document.id.starts_with("src/billing.py"));
}

#[tokio::test]
async fn test_chat_over_index_with_persistence() {
    let tmp = TempDir::new().unwrap();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(1024));
    let mut index = EmbeddingIndex::for_embedder(embedder.as_ref());
    index
        .add(
            embedder.as_ref(),
            vec![
                Document::new("TK-1", "Fix login bug: SSO redirect loops"),
                Document::new("TK-2", "Add dark mode theme toggle"),
            ],
            8,
        )
        .await
        .unwrap();
    let shared = SharedIndex::new(index);
    let store = HistoryStore::new(tmp.path());
    let options = ChatOptions {
        top_k: 1,
        ..ChatOptions::default()
    };

    let session = ChatSession::new(Arc::new(EchoGenerator), options.clone())
        .with_retriever(Retriever::new(shared.clone(), embedder.clone()))
        .with_store(store.clone());
    let answer = session.chat("login redirect").await.unwrap();
    assert!(answer.contains("TK-1"));
    assert!(!answer.contains("TK-2"));

    let resumed = ChatSession::resume(session.id(), Arc::new(EchoGenerator), options, store).unwrap();
    let history = resumed.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "login redirect");
}
