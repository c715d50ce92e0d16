//! Single-file JSON snapshot of the chunk store and the embedding index.
//!
//! The file is written to a sibling temporary path and renamed into place. Chunk records carry
//! exactly `{document_id, page_number, paragraph_index, text}` plus their id and embedding.

use super::{EmbeddingIndex, IndexError};
use crate::embedding::EmbeddingSpace;
use crate::processing::store::ChunkStore;
use crate::processing::types::{Chunk, ChunkId, DocumentId, DocumentRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors raised while reading or writing snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem access failed.
    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// JSON encoding or decoding failed.
    #[error("Snapshot is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The file was written by an incompatible format version.
    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    /// The stored vectors do not fit the stored embedding space.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// One persisted chunk with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Page the chunk was cut from.
    pub page_number: u32,
    /// Position within the page.
    pub paragraph_index: u32,
    /// Chunk text.
    pub text: String,
    /// Index vector; absent when the chunk was never indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Serialized pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version.
    pub version: u32,
    /// Space the embeddings belong to.
    pub embedding_space: Option<EmbeddingSpace>,
    /// Next identifier the store will hand out.
    pub next_chunk_id: u64,
    /// Document records.
    pub documents: Vec<DocumentRecord>,
    /// Chunk records ordered by id.
    pub chunks: Vec<ChunkRecord>,
}

impl Snapshot {
    /// Capture the current contents of `store` and `index`.
    pub async fn capture(store: &ChunkStore, index: &EmbeddingIndex) -> Self {
        let (next_chunk_id, documents, chunks) = store.export().await;
        let (embedding_space, mut vectors) = index.export().await;

        let chunks = chunks
            .iter()
            .map(|chunk| ChunkRecord {
                chunk_id: chunk.chunk_id,
                document_id: chunk.document_id.clone(),
                page_number: chunk.page_number,
                paragraph_index: chunk.paragraph_index,
                text: chunk.text.clone(),
                embedding: vectors.remove(&chunk.chunk_id),
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            embedding_space,
            next_chunk_id,
            documents,
            chunks,
        }
    }

    /// Replace the contents of `store` and `index` with this snapshot.
    pub async fn restore_into(
        self,
        store: &ChunkStore,
        index: &EmbeddingIndex,
    ) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version));
        }

        let mut chunks = Vec::with_capacity(self.chunks.len());
        let mut entries = Vec::new();
        for record in self.chunks {
            if let Some(embedding) = record.embedding {
                entries.push((record.chunk_id, embedding));
            }
            chunks.push(Chunk {
                chunk_id: record.chunk_id,
                document_id: record.document_id,
                page_number: record.page_number,
                paragraph_index: record.paragraph_index,
                text: record.text,
            });
        }

        index.restore(self.embedding_space, entries).await?;
        store.restore(self.next_chunk_id, self.documents, chunks).await;
        Ok(())
    }
}

/// Write `snapshot` to `path` atomically (temp file, then rename).
pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    let bytes = serde_json::to_vec(snapshot)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| io_error(parent, source))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|source| io_error(&temp, source))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|source| io_error(path, source))?;

    tracing::info!(
        path = %path.display(),
        chunks = snapshot.chunks.len(),
        documents = snapshot.documents.len(),
        "Wrote index snapshot"
    );
    Ok(())
}

/// Read a snapshot from `path`; `Ok(None)` when the file does not exist.
pub async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path, source)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn io_error(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClient, HashingEmbeddingClient};
    use crate::processing::types::{Document, Page};

    fn document(id: &str, text: &str) -> Document {
        Document {
            id: DocumentId::new(id),
            name: format!("{id}.txt"),
            mime_type: "text/plain".into(),
            pages: vec![Page::from_text(1, text)],
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");
        let embedder = HashingEmbeddingClient::new("v1", 32);

        let store = ChunkStore::default();
        let index = EmbeddingIndex::new();
        let chunks = store
            .ingest(document("a", "Inflation slowed in spring.\n\nWages kept rising."))
            .await
            .unwrap();
        index.add(&embedder, &chunks).await.unwrap();

        let snapshot = Snapshot::capture(&store, &index).await;
        write_snapshot(&path, &snapshot).await.unwrap();

        let loaded = read_snapshot(&path).await.unwrap().expect("snapshot exists");
        assert_eq!(loaded.documents, snapshot.documents);
        assert_eq!(loaded.next_chunk_id, 2);
        assert!(loaded.chunks.iter().all(|chunk| chunk.embedding.is_some()));

        let restored_store = ChunkStore::default();
        let restored_index = EmbeddingIndex::new();
        loaded
            .restore_into(&restored_store, &restored_index)
            .await
            .unwrap();

        assert_eq!(restored_store.chunk_count().await, 2);
        assert_eq!(restored_index.len().await, 2);
        assert_eq!(restored_index.space().await.as_ref(), Some(embedder.space()));

        let next = restored_store
            .ingest(document("b", "Another document here."))
            .await
            .unwrap();
        assert_eq!(next[0].chunk_id.get(), 2);
    }

    #[tokio::test]
    async fn missing_snapshot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = read_snapshot(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let snapshot = Snapshot {
            version: 99,
            embedding_space: None,
            next_chunk_id: 0,
            documents: Vec::new(),
            chunks: Vec::new(),
        };
        let error = snapshot
            .restore_into(&ChunkStore::default(), &EmbeddingIndex::new())
            .await
            .unwrap_err();
        assert!(matches!(error, SnapshotError::UnsupportedVersion(99)));
    }
}
