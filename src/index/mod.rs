//! Exact cosine-similarity index keyed by `ChunkId`.
//!
//! The index records the [`EmbeddingSpace`] it was populated under on the first `add` and
//! rejects writes and queries from any other space. Vectors are unit length, so the score of a
//! hit is the dot product and lies in `[-1, 1]`.
//!
//! Access follows a reader/writer discipline: searches share the read lock, upserts take the
//! write lock. Embedding vectors are computed before the write lock is acquired.

pub mod snapshot;

use crate::embedding::{EmbeddingClient, EmbeddingClientError, EmbeddingSpace, normalize};
use crate::processing::types::{Chunk, ChunkId};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by the embedding index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The caller's embedding function differs from the one the index was built with.
    #[error("embedding space mismatch: index uses {expected}, caller uses {actual}")]
    EmbeddingSpaceMismatch {
        /// Space recorded with the index.
        expected: EmbeddingSpace,
        /// Space reported by the caller.
        actual: EmbeddingSpace,
    },
    /// A vector's length differs from the space dimension.
    #[error("vector dimension mismatch: expected {expected}, received {actual}")]
    DimensionMismatch {
        /// Dimension declared by the space.
        expected: usize,
        /// Dimension actually received.
        actual: usize,
    },
    /// The embedding client returned a different number of vectors than texts sent.
    #[error("embedding count mismatch: sent {expected} texts, received {actual} vectors")]
    CountMismatch {
        /// Number of texts sent.
        expected: usize,
        /// Number of vectors received.
        actual: usize,
    },
    /// The embedding collaborator failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
}

impl IndexError {
    /// Configuration faults that must abort a whole indexing operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Embedding(_))
    }
}

/// Counts reported by [`EmbeddingIndex::add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Entries that did not exist before.
    pub inserted: usize,
    /// Entries whose vector was replaced.
    pub replaced: usize,
}

/// A query embedding tagged with the space that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryVector {
    space: EmbeddingSpace,
    values: Vec<f32>,
}

impl QueryVector {
    /// Space the vector belongs to.
    pub fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    /// Unit-length vector components.
    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

#[derive(Debug, Default)]
struct IndexState {
    space: Option<EmbeddingSpace>,
    vectors: BTreeMap<ChunkId, Vec<f32>>,
}

impl IndexState {
    fn check_space(&self, actual: &EmbeddingSpace) -> Result<(), IndexError> {
        match &self.space {
            Some(expected) if expected != actual => Err(IndexError::EmbeddingSpaceMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Flat vector index over chunk embeddings.
#[derive(Debug, Default)]
pub struct EmbeddingIndex {
    state: RwLock<IndexState>,
}

impl EmbeddingIndex {
    /// Create an empty index that binds to the first space it sees.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty index bound to `space` up front.
    pub fn with_space(space: EmbeddingSpace) -> Self {
        Self {
            state: RwLock::new(IndexState {
                space: Some(space),
                vectors: BTreeMap::new(),
            }),
        }
    }

    /// Embed and upsert chunks. Re-adding a `chunk_id` replaces its vector.
    pub async fn add(
        &self,
        embedder: &dyn EmbeddingClient,
        chunks: &[Arc<Chunk>],
    ) -> Result<IndexSummary, IndexError> {
        let space = embedder.space();
        self.state.read().await.check_space(space)?;
        if chunks.is_empty() {
            return Ok(IndexSummary::default());
        }

        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = embedder.generate_embeddings(texts).await?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::CountMismatch {
                expected: chunks.len(),
                actual: vectors.len(),
            });
        }

        let mut prepared = Vec::with_capacity(vectors.len());
        for (chunk, mut vector) in chunks.iter().zip(vectors) {
            if vector.len() != space.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: space.dimension,
                    actual: vector.len(),
                });
            }
            normalize(&mut vector);
            prepared.push((chunk.chunk_id, vector));
        }

        let mut state = self.state.write().await;
        state.check_space(space)?;
        if state.space.is_none() {
            tracing::info!(space = %space, "Binding index to embedding space");
            state.space = Some(space.clone());
        }

        let mut summary = IndexSummary::default();
        for (chunk_id, vector) in prepared {
            if state.vectors.insert(chunk_id, vector).is_some() {
                summary.replaced += 1;
            } else {
                summary.inserted += 1;
            }
        }
        tracing::debug!(
            inserted = summary.inserted,
            replaced = summary.replaced,
            total = state.vectors.len(),
            "Upserted index entries"
        );
        Ok(summary)
    }

    /// Embed query text in the index's space.
    pub async fn embed_query(
        &self,
        embedder: &dyn EmbeddingClient,
        text: &str,
    ) -> Result<QueryVector, IndexError> {
        let space = embedder.space();
        self.state.read().await.check_space(space)?;

        let mut vectors = embedder.generate_embeddings(vec![text.to_string()]).await?;
        let count = vectors.len();
        let mut values = match (vectors.pop(), count) {
            (Some(values), 1) => values,
            _ => {
                return Err(IndexError::CountMismatch {
                    expected: 1,
                    actual: count,
                });
            }
        };
        if values.len() != space.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: space.dimension,
                actual: values.len(),
            });
        }
        normalize(&mut values);
        Ok(QueryVector {
            space: space.clone(),
            values,
        })
    }

    /// Every entry scoring at least `min_score`, best first; equal scores order by `chunk_id`.
    pub async fn search(
        &self,
        query: &QueryVector,
        min_score: f32,
    ) -> Result<Vec<(ChunkId, f32)>, IndexError> {
        let state = self.state.read().await;
        state.check_space(&query.space)?;

        let mut hits: Vec<(ChunkId, f32)> = state
            .vectors
            .iter()
            .map(|(chunk_id, vector)| (*chunk_id, dot(vector, &query.values)))
            .filter(|(_, score)| *score >= min_score)
            .collect();
        hits.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        Ok(hits)
    }

    /// Drop entries for the given chunks, returning how many existed.
    pub async fn remove(&self, chunk_ids: &[ChunkId]) -> usize {
        let mut state = self.state.write().await;
        chunk_ids
            .iter()
            .filter(|chunk_id| state.vectors.remove(chunk_id).is_some())
            .count()
    }

    /// Whether the chunk has an embedding.
    pub async fn contains(&self, chunk_id: ChunkId) -> bool {
        self.state.read().await.vectors.contains_key(&chunk_id)
    }

    /// Number of indexed chunks.
    pub async fn len(&self) -> usize {
        self.state.read().await.vectors.len()
    }

    /// Whether the index holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.vectors.is_empty()
    }

    /// Space the index is bound to, if any.
    pub async fn space(&self) -> Option<EmbeddingSpace> {
        self.state.read().await.space.clone()
    }

    pub(crate) async fn export(&self) -> (Option<EmbeddingSpace>, BTreeMap<ChunkId, Vec<f32>>) {
        let state = self.state.read().await;
        (state.space.clone(), state.vectors.clone())
    }

    pub(crate) async fn restore(
        &self,
        space: Option<EmbeddingSpace>,
        entries: Vec<(ChunkId, Vec<f32>)>,
    ) -> Result<(), IndexError> {
        let mut vectors = BTreeMap::new();
        if let Some(space) = &space {
            for (chunk_id, mut vector) in entries {
                if vector.len() != space.dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: space.dimension,
                        actual: vector.len(),
                    });
                }
                normalize(&mut vector);
                vectors.insert(chunk_id, vector);
            }
        }
        let mut state = self.state.write().await;
        state.space = space;
        state.vectors = vectors;
        Ok(())
    }
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbeddingClient;
    use crate::processing::types::DocumentId;
    use async_trait::async_trait;

    fn chunk(id: u64, text: &str) -> Arc<Chunk> {
        Arc::new(Chunk {
            chunk_id: ChunkId::new(id),
            document_id: DocumentId::new("doc"),
            page_number: 1,
            paragraph_index: id as u32,
            text: text.into(),
        })
    }

    struct FixedEmbedder {
        space: EmbeddingSpace,
        vectors: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        fn space(&self) -> &EmbeddingSpace {
            &self.space
        }

        async fn generate_embeddings(
            &self,
            _texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(self.vectors.clone())
        }
    }

    #[tokio::test]
    async fn re_adding_replaces_instead_of_duplicating() {
        let index = EmbeddingIndex::new();
        let embedder = HashingEmbeddingClient::new("v1", 64);
        let chunks = vec![chunk(0, "interest rates rose"), chunk(1, "crop yields fell")];

        let first = index.add(&embedder, &chunks).await.unwrap();
        let query = index.embed_query(&embedder, "interest rates").await.unwrap();
        let before = index.search(&query, -1.0).await.unwrap();

        let second = index.add(&embedder, &chunks).await.unwrap();
        let after = index.search(&query, -1.0).await.unwrap();

        assert_eq!(first, IndexSummary { inserted: 2, replaced: 0 });
        assert_eq!(second, IndexSummary { inserted: 0, replaced: 2 });
        assert_eq!(index.len().await, 2);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn mismatched_space_is_rejected_for_add_and_query() {
        let index = EmbeddingIndex::new();
        let a = HashingEmbeddingClient::new("model-a", 64);
        let b = HashingEmbeddingClient::new("model-b", 64);
        index.add(&a, &[chunk(0, "alpha text")]).await.unwrap();

        let add_error = index.add(&b, &[chunk(1, "beta text")]).await.unwrap_err();
        assert!(matches!(add_error, IndexError::EmbeddingSpaceMismatch { .. }));
        assert!(add_error.is_fatal());

        let query_error = index.embed_query(&b, "alpha").await.unwrap_err();
        assert!(matches!(query_error, IndexError::EmbeddingSpaceMismatch { .. }));

        let query = b.space().clone();
        let foreign = QueryVector {
            space: query,
            values: vec![0.0; 64],
        };
        assert!(index.search(&foreign, 0.0).await.is_err());
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn equal_scores_order_by_chunk_id() {
        let index = EmbeddingIndex::new();
        let embedder = HashingEmbeddingClient::new("v1", 64);
        let chunks = vec![
            chunk(7, "same words here"),
            chunk(3, "same words here"),
            chunk(5, "same words here"),
        ];
        index.add(&embedder, &chunks).await.unwrap();

        let query = index.embed_query(&embedder, "same words here").await.unwrap();
        let hits = index.search(&query, 0.5).await.unwrap();
        let ids: Vec<u64> = hits.iter().map(|(id, _)| id.get()).collect();
        assert_eq!(ids, vec![3, 5, 7]);
        assert!(hits.iter().all(|(_, score)| (*score - 1.0).abs() < 1e-5));
    }

    #[tokio::test]
    async fn wrong_dimension_and_count_are_fatal() {
        let index = EmbeddingIndex::new();
        let short = FixedEmbedder {
            space: EmbeddingSpace::new("fixed", "m", 3),
            vectors: vec![vec![1.0, 0.0]],
        };
        let error = index.add(&short, &[chunk(0, "text")]).await.unwrap_err();
        assert!(matches!(error, IndexError::DimensionMismatch { expected: 3, actual: 2 }));
        assert!(error.is_fatal());

        let missing = FixedEmbedder {
            space: EmbeddingSpace::new("fixed", "m", 3),
            vectors: Vec::new(),
        };
        let error = index.add(&missing, &[chunk(0, "text")]).await.unwrap_err();
        assert!(matches!(error, IndexError::CountMismatch { .. }));
        assert!(index.is_empty().await);
        assert!(index.space().await.is_none());
    }

    #[tokio::test]
    async fn remove_drops_entries() {
        let index = EmbeddingIndex::new();
        let embedder = HashingEmbeddingClient::new("v1", 32);
        index
            .add(&embedder, &[chunk(0, "one"), chunk(1, "two")])
            .await
            .unwrap();

        assert_eq!(index.remove(&[ChunkId::new(0), ChunkId::new(9)]).await, 1);
        assert!(!index.contains(ChunkId::new(0)).await);
        assert!(index.contains(ChunkId::new(1)).await);
    }
}
