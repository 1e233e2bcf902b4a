//! In-memory embedding index with single-file persistence.
//!
//! An [`EmbeddingIndex`] holds documents and their embedding vectors in
//! insertion order, keyed by document id. Re-adding an id replaces the
//! entry in place, so the first-seen position of an id never changes.
//!
//! # File Format
//!
//! ```text
//! ┌────────┬──────────────┬────────────────┬─────────────┬──────────────────────────┐
//! │ DAXIDX │ version u32  │ header_len u32 │ JSON header │ count × dim × f32 (LE)   │
//! └────────┴──────────────┴────────────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! The JSON header is `{dimension, model, count, documents}`. Vectors follow
//! in document order, encoded with [`vec_to_blob`]. [`EmbeddingIndex::save`]
//! writes `<path>.tmp` and renames it over `path`, so a reader never sees a
//! partially written file. There is no cross-process locking.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, Embedder};
use crate::error::{Error, Result};
use crate::models::{Document, SearchHit};

const MAGIC: &[u8; 6] = b"DAXIDX";
const FORMAT_VERSION: u32 = 1;
const PREAMBLE_LEN: usize = MAGIC.len() + 4 + 4;

/// One stored document and its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub document: Document,
    pub embedding: Vec<f32>,
}

#[derive(Serialize)]
struct HeaderOut<'a> {
    dimension: usize,
    model: &'a str,
    count: usize,
    documents: Vec<&'a Document>,
}

#[derive(Deserialize)]
struct HeaderIn {
    dimension: usize,
    #[serde(default)]
    model: String,
    count: usize,
    documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingIndex {
    dimension: usize,
    model: String,
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

impl EmbeddingIndex {
    /// Create an empty index for vectors of `dimension` produced by `model`.
    pub fn new(dimension: usize, model: impl Into<String>) -> Self {
        Self {
            dimension,
            model: model.into(),
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Create an empty index matching an embedder's model and dimension.
    pub fn for_embedder(embedder: &dyn Embedder) -> Self {
        Self::new(embedder.dims(), embedder.model_name())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.positions.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Upsert pre-embedded documents.
    ///
    /// Every vector is checked before anything is written; on error the
    /// index is unchanged.
    pub fn insert_embedded(&mut self, items: Vec<(Document, Vec<f32>)>) -> Result<usize> {
        if let Some((_, bad)) = items.iter().find(|(_, v)| v.len() != self.dimension) {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        let count = items.len();
        for (document, embedding) in items {
            self.upsert(IndexEntry {
                document,
                embedding,
            });
        }
        Ok(count)
    }

    fn upsert(&mut self, entry: IndexEntry) {
        match self.positions.get(&entry.document.id) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.positions
                    .insert(entry.document.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    fn check_model(&self, other: &str) -> Result<()> {
        if !self.model.is_empty() && !other.is_empty() && self.model != other {
            return Err(Error::ModelMismatch {
                index: self.model.clone(),
                query: other.to_string(),
            });
        }
        Ok(())
    }

    /// Embed and upsert `documents`. All-or-nothing: any embedding failure
    /// leaves the index untouched.
    pub async fn add(
        &mut self,
        embedder: &dyn Embedder,
        documents: Vec<Document>,
        batch_size: usize,
    ) -> Result<usize> {
        self.check_model(embedder.model_name())?;
        let embedded = embed_documents(embedder, documents, batch_size).await?;
        self.insert_embedded(embedded)
    }

    /// Rank every entry by cosine similarity to `query`.
    ///
    /// Results are sorted by descending score; equal scores keep insertion
    /// order. `k == 0` yields nothing and `k > len` yields everything.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (pos, cosine_similarity(query, &e.embedding)))
            .collect();

        // sort_by is stable, so ties stay in insertion order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(pos, score)| SearchHit {
                document: self.entries[pos].document.clone(),
                score,
            })
            .collect()
    }

    /// Embed `query` with `embedder` and return the top `k` hits.
    pub async fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.check_model(embedder.model_name())?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let vector = embed_one(embedder, query).await?;
        self.check_query(&vector)?;
        Ok(self.search_vector(&vector, k))
    }

    fn check_query(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Upsert every entry of `other` into `self`, in `other`'s order.
    ///
    /// On conflicting ids `other` wins. Fails before mutating anything if the
    /// dimensions (or declared models) differ.
    pub fn merge(&mut self, other: &EmbeddingIndex) -> Result<()> {
        if self.dimension != other.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: other.dimension,
            });
        }
        self.check_model(&other.model)?;
        if self.model.is_empty() {
            self.model = other.model.clone();
        }

        for entry in &other.entries {
            self.upsert(entry.clone());
        }
        Ok(())
    }

    /// Left-to-right pairwise merge of a sequence of indexes.
    pub fn merge_all(indexes: impl IntoIterator<Item = EmbeddingIndex>) -> Result<EmbeddingIndex> {
        let mut iter = indexes.into_iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| Error::Config("merge requires at least one index".to_string()))?;
        for next in iter {
            merged.merge(&next)?;
        }
        Ok(merged)
    }

    /// Serialize to the on-disk format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&HeaderOut {
            dimension: self.dimension,
            model: &self.model,
            count: self.entries.len(),
            documents: self.entries.iter().map(|e| &e.document).collect(),
        })?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::CorruptIndex("header exceeds 4 GiB".to_string()))?;

        let mut bytes =
            Vec::with_capacity(PREAMBLE_LEN + header.len() + self.len() * self.dimension * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&header_len.to_le_bytes());
        bytes.extend_from_slice(&header);
        for entry in &self.entries {
            bytes.extend_from_slice(&vec_to_blob(&entry.embedding));
        }
        Ok(bytes)
    }

    /// Parse the on-disk format. Any structural problem is [`Error::CorruptIndex`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(corrupt("file is shorter than the preamble"));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let version = read_u32(&bytes[6..10]);
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!(
                "unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }

        let header_len = read_u32(&bytes[10..14]) as usize;
        let header_end = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| corrupt("header length exceeds file size"))?;

        let header: HeaderIn = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end])
            .map_err(|e| corrupt(&format!("invalid header: {}", e)))?;
        if header.count != header.documents.len() {
            return Err(corrupt(&format!(
                "header declares {} documents but lists {}",
                header.count,
                header.documents.len()
            )));
        }

        let vector_bytes = &bytes[header_end..];
        let expected = header
            .count
            .checked_mul(header.dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| corrupt("vector section size overflows"))?;
        if vector_bytes.len() != expected {
            return Err(corrupt(&format!(
                "expected {} bytes of vectors, found {}",
                expected,
                vector_bytes.len()
            )));
        }

        let mut index = EmbeddingIndex::new(header.dimension, header.model);
        let stride = header.dimension * 4;
        for (i, document) in header.documents.into_iter().enumerate() {
            if index.contains(&document.id) {
                return Err(corrupt(&format!("duplicate document id '{}'", document.id)));
            }
            let embedding = blob_to_vec(&vector_bytes[i * stride..(i + 1) * stride]);
            index.upsert(IndexEntry {
                document,
                embedding,
            });
        }
        Ok(index)
    }

    /// Atomically persist to `path` (write `<path>.tmp`, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        let tmp = tmp_path(path);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(
            path = %path.display(),
            documents = self.len(),
            dimension = self.dimension,
            "saved index"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let index = Self::from_bytes(&bytes)?;
        tracing::debug!(path = %path.display(), documents = index.len(), "loaded index");
        Ok(index)
    }
}

fn corrupt(msg: &str) -> Error {
    Error::CorruptIndex(msg.to_string())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embed_query(embedder, text)
        .await
        .map_err(|e| Error::EmbeddingBackend(format!("{:#}", e)))
}

/// Embed `documents` in batches of `batch_size` without touching any index.
///
/// A short or long response from the embedder is treated as a backend fault.
pub async fn embed_documents(
    embedder: &dyn Embedder,
    documents: Vec<Document>,
    batch_size: usize,
) -> Result<Vec<(Document, Vec<f32>)>> {
    let batch_size = batch_size.max(1);
    let mut vectors = Vec::with_capacity(documents.len());

    for batch in documents.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let embedded = embedder
            .embed(&texts)
            .await
            .map_err(|e| Error::EmbeddingBackend(format!("{:#}", e)))?;
        if embedded.len() != texts.len() {
            return Err(Error::EmbeddingBackend(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
    }

    Ok(documents.into_iter().zip(vectors).collect())
}

/// An index shared between request handlers.
///
/// Readers run concurrently; writers are exclusive. Embedding happens before
/// the write lock is taken so slow backends never block searches.
#[derive(Clone)]
pub struct SharedIndex {
    inner: Arc<RwLock<EmbeddingIndex>>,
}

impl SharedIndex {
    pub fn new(index: EmbeddingIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(index)),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, EmbeddingIndex> {
        self.inner.read().await
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn add(
        &self,
        embedder: &dyn Embedder,
        documents: Vec<Document>,
        batch_size: usize,
    ) -> Result<usize> {
        self.inner.read().await.check_model(embedder.model_name())?;
        let embedded = embed_documents(embedder, documents, batch_size).await?;
        self.inner.write().await.insert_embedded(embedded)
    }

    pub async fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        {
            let index = self.inner.read().await;
            index.check_model(embedder.model_name())?;
            if k == 0 || index.is_empty() {
                return Ok(Vec::new());
            }
        }
        let vector = embed_one(embedder, query).await?;
        let index = self.inner.read().await;
        index.check_query(&vector)?;
        Ok(index.search_vector(&vector, k))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.inner.read().await.save(path)
    }
}
