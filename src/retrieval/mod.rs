//! Query-time retrieval: embed, rank, filter and resolve chunks.

use crate::embedding::EmbeddingClient;
use crate::index::{EmbeddingIndex, IndexError};
use crate::processing::store::ChunkStore;
use crate::processing::types::{Chunk, ChunkId, DocumentId};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by [`Retriever::search`].
#[derive(Debug, Error)]
pub enum SearchError {
    /// The caller supplied an unusable query.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// Query embedding or index lookup failed.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// A retrieved chunk and its cosine score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// Resolved chunk.
    pub chunk: Arc<Chunk>,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Ranked retrieval hits: score non-increasing, ties ordered by ascending `chunk_id`.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    /// Build a result, imposing the ranking order.
    pub fn new(mut hits: Vec<ScoredChunk>) -> Self {
        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.chunk.chunk_id.cmp(&right.chunk.chunk_id))
        });
        Self { hits }
    }

    /// Hits in rank order.
    pub fn hits(&self) -> &[ScoredChunk] {
        &self.hits
    }

    /// `(chunk_id, score)` pairs in rank order.
    pub fn ranking(&self) -> Vec<(ChunkId, f32)> {
        self.hits
            .iter()
            .map(|hit| (hit.chunk.chunk_id, hit.score))
            .collect()
    }

    /// Number of hits.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether nothing cleared the score threshold.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Whether `chunk_id` is among the hits.
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.hits.iter().any(|hit| hit.chunk.chunk_id == chunk_id)
    }

    /// Split the hits per owning document.
    ///
    /// Documents appear in order of their best-ranked hit; hits keep their rank order.
    pub fn by_document(&self) -> Vec<(DocumentId, RetrievalResult)> {
        let mut groups: Vec<(DocumentId, Vec<ScoredChunk>)> = Vec::new();
        for hit in &self.hits {
            match groups
                .iter_mut()
                .find(|(document_id, _)| *document_id == hit.chunk.document_id)
            {
                Some((_, hits)) => hits.push(hit.clone()),
                None => groups.push((hit.chunk.document_id.clone(), vec![hit.clone()])),
            }
        }
        groups
            .into_iter()
            .map(|(document_id, hits)| (document_id, Self { hits }))
            .collect()
    }
}

/// Answers nearest-neighbour queries against the store and index.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<ChunkStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl Retriever {
    /// Build a retriever over shared pipeline state.
    pub fn new(
        store: Arc<ChunkStore>,
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
        }
    }

    /// Return at most `k` chunks scoring at least `min_score` against `query`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<RetrievalResult, SearchError> {
        self.search_filtered(query, k, min_score, None).await
    }

    /// Like [`search`](Self::search), restricted to chunks of the listed documents.
    ///
    /// An empty list places no restriction, same as `None`.
    pub async fn search_filtered(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
        documents: Option<&[DocumentId]>,
    ) -> Result<RetrievalResult, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::InvalidQuery("query text must not be empty".into()));
        }
        if k == 0 {
            return Err(SearchError::InvalidQuery("k must be greater than zero".into()));
        }
        if !(-1.0..=1.0).contains(&min_score) {
            return Err(SearchError::InvalidQuery(format!(
                "min_score must lie in [-1, 1], got {min_score}"
            )));
        }

        let documents = documents.filter(|allowed| !allowed.is_empty());

        let vector = self.index.embed_query(self.embedder.as_ref(), query).await?;
        let ranked = self.index.search(&vector, min_score).await?;

        let mut hits = Vec::with_capacity(k.min(ranked.len()));
        for (chunk_id, score) in ranked {
            if hits.len() == k {
                break;
            }
            let Some(chunk) = self.store.get(chunk_id).await else {
                tracing::debug!(%chunk_id, "Skipping index entry without stored chunk");
                continue;
            };
            if documents.is_some_and(|allowed| !allowed.contains(&chunk.document_id)) {
                continue;
            }
            hits.push(ScoredChunk { chunk, score });
        }

        tracing::debug!(k, min_score, hits = hits.len(), "Retrieved chunks");
        Ok(RetrievalResult::new(hits))
    }
}
