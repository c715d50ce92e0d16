//! In-process chunk store.
//!
//! The store owns every chunk (as `Arc<Chunk>`) and the per-document records. Identifiers are
//! handed out from a counter that lives under the store's write lock; batch commits reserve one
//! contiguous range per document in input order, so the ids a batch receives never depend on
//! how the drafting work was scheduled.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::chunking::{ChunkDraft, ChunkPolicy};
use super::mappers::build_document_record;
use super::types::{Chunk, ChunkError, ChunkId, Document, DocumentId, DocumentRecord};

/// A document split into drafts, ready to receive identifiers.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    document: Document,
    drafts: Vec<ChunkDraft>,
}

impl PreparedDocument {
    /// Identity of the prepared document.
    pub fn document_id(&self) -> &DocumentId {
        &self.document.id
    }

    /// Number of chunks the document will produce.
    pub fn chunk_count(&self) -> usize {
        self.drafts.len()
    }

    /// Pages reported by extraction, including blank ones.
    pub fn page_count(&self) -> usize {
        self.document.pages.len()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    chunks: BTreeMap<ChunkId, Arc<Chunk>>,
    documents: BTreeMap<DocumentId, DocumentRecord>,
}

/// Splits documents into chunks and keeps them addressable by `ChunkId`.
#[derive(Debug, Default)]
pub struct ChunkStore {
    policy: ChunkPolicy,
    state: RwLock<StoreState>,
}

impl ChunkStore {
    /// Create an empty store using the given boundary policy.
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            policy,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Boundary policy used by this store.
    pub fn policy(&self) -> ChunkPolicy {
        self.policy
    }

    /// Split a document without touching store state.
    ///
    /// Safe to call from many tasks at once; fails with [`ChunkError::EmptyDocument`] when the
    /// document carries no non-whitespace text.
    pub fn prepare(&self, document: Document) -> Result<PreparedDocument, ChunkError> {
        if document.id.is_empty() {
            return Err(ChunkError::InvalidDocumentId);
        }
        if !document.has_text() {
            return Err(ChunkError::EmptyDocument {
                document_id: document.id,
            });
        }
        let drafts = self.policy.split_document(&document);
        if drafts.is_empty() {
            return Err(ChunkError::EmptyDocument {
                document_id: document.id,
            });
        }
        Ok(PreparedDocument { document, drafts })
    }

    /// Chunk and register a single document.
    pub async fn ingest(&self, document: Document) -> Result<Vec<Arc<Chunk>>, ChunkError> {
        let prepared = self.prepare(document)?;
        let mut state = self.state.write().await;
        commit_locked(&mut state, prepared)
    }

    /// Register several prepared documents, reserving id ranges in input order.
    pub async fn commit_batch(
        &self,
        prepared: Vec<PreparedDocument>,
    ) -> Vec<Result<Vec<Arc<Chunk>>, ChunkError>> {
        let mut state = self.state.write().await;
        prepared
            .into_iter()
            .map(|document| commit_locked(&mut state, document))
            .collect()
    }

    /// Look up a chunk by identifier.
    pub async fn get(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.state.read().await.chunks.get(&chunk_id).cloned()
    }

    /// Resolve many identifiers under one read lock, preserving input order and skipping misses.
    pub async fn get_many(&self, chunk_ids: &[ChunkId]) -> Vec<Arc<Chunk>> {
        let state = self.state.read().await;
        chunk_ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect()
    }

    /// Chunks owned by a document, in document order.
    pub async fn chunks_for(&self, document_id: &DocumentId) -> Vec<Arc<Chunk>> {
        let state = self.state.read().await;
        state
            .documents
            .get(document_id)
            .map(|record| {
                record
                    .chunk_ids
                    .iter()
                    .filter_map(|id| state.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stored record for a document.
    pub async fn document(&self, document_id: &DocumentId) -> Option<DocumentRecord> {
        self.state.read().await.documents.get(document_id).cloned()
    }

    /// All stored document records ordered by identifier.
    pub async fn documents(&self) -> Vec<DocumentRecord> {
        self.state.read().await.documents.values().cloned().collect()
    }

    /// Total number of stored chunks.
    pub async fn chunk_count(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    /// Drop a document and every chunk it owns.
    pub async fn remove_document(&self, document_id: &DocumentId) -> Option<DocumentRecord> {
        let mut state = self.state.write().await;
        let record = state.documents.remove(document_id)?;
        for id in &record.chunk_ids {
            state.chunks.remove(id);
        }
        Some(record)
    }

    /// Copy out all records and chunks for persistence.
    pub(crate) async fn export(&self) -> (u64, Vec<DocumentRecord>, Vec<Arc<Chunk>>) {
        let state = self.state.read().await;
        (
            state.next_id,
            state.documents.values().cloned().collect(),
            state.chunks.values().cloned().collect(),
        )
    }

    /// Replace store contents with previously exported state.
    pub(crate) async fn restore(
        &self,
        next_id: u64,
        documents: Vec<DocumentRecord>,
        chunks: Vec<Chunk>,
    ) {
        let mut state = self.state.write().await;
        let highest = chunks.iter().map(|chunk| chunk.chunk_id.get() + 1).max();
        state.next_id = next_id.max(highest.unwrap_or(0));
        state.chunks = chunks
            .into_iter()
            .map(|chunk| (chunk.chunk_id, Arc::new(chunk)))
            .collect();
        state.documents = documents
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
    }
}

fn commit_locked(
    state: &mut StoreState,
    prepared: PreparedDocument,
) -> Result<Vec<Arc<Chunk>>, ChunkError> {
    let PreparedDocument { document, drafts } = prepared;
    if state.documents.contains_key(&document.id) {
        return Err(ChunkError::DuplicateDocument {
            document_id: document.id,
        });
    }

    let first = state.next_id;
    state.next_id += drafts.len() as u64;

    let chunks: Vec<Arc<Chunk>> = drafts
        .into_iter()
        .enumerate()
        .map(|(offset, draft)| {
            Arc::new(Chunk {
                chunk_id: ChunkId::new(first + offset as u64),
                document_id: document.id.clone(),
                page_number: draft.page_number,
                paragraph_index: draft.paragraph_index,
                text: draft.text,
            })
        })
        .collect();

    for chunk in &chunks {
        state.chunks.insert(chunk.chunk_id, Arc::clone(chunk));
    }
    let chunk_ids = chunks.iter().map(|chunk| chunk.chunk_id).collect();
    state
        .documents
        .insert(document.id.clone(), build_document_record(&document, chunk_ids));

    tracing::debug!(
        document_id = %document.id,
        first_chunk_id = first,
        chunks = chunks.len(),
        "Registered document chunks"
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::types::Page;

    fn document(id: &str, text: &str) -> Document {
        Document {
            id: DocumentId::new(id),
            name: format!("{id}.txt"),
            mime_type: "text/plain".into(),
            pages: vec![Page::from_text(1, text)],
        }
    }

    #[tokio::test]
    async fn ingest_assigns_increasing_ids_across_documents() {
        let store = ChunkStore::default();
        let first = store
            .ingest(document("a", "Alpha one here.\n\nAlpha two here."))
            .await
            .unwrap();
        let second = store.ingest(document("b", "Beta only here.")).await.unwrap();

        let ids: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|chunk| chunk.chunk_id.get())
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(store.chunk_count().await, 3);
    }

    #[tokio::test]
    async fn whitespace_document_is_rejected() {
        let store = ChunkStore::default();
        let error = store.ingest(document("blank", " \n\t ")).await.unwrap_err();
        assert!(matches!(error, ChunkError::EmptyDocument { .. }));
        assert!(store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_document_is_rejected_without_consuming_ids() {
        let store = ChunkStore::default();
        store.ingest(document("a", "Alpha one here.")).await.unwrap();
        let error = store
            .ingest(document("a", "Alpha again here."))
            .await
            .unwrap_err();
        assert!(matches!(error, ChunkError::DuplicateDocument { .. }));

        let next = store.ingest(document("b", "Beta text here.")).await.unwrap();
        assert_eq!(next[0].chunk_id.get(), 1);
    }

    #[tokio::test]
    async fn batch_commit_partitions_ids_in_input_order() {
        let store = ChunkStore::default();
        let prepared: Vec<PreparedDocument> = vec![
            store.prepare(document("x", "X one here.\n\nX two here.")).unwrap(),
            store.prepare(document("y", "Y one here.")).unwrap(),
        ];
        let results = store.commit_batch(prepared).await;

        let x = results[0].as_ref().unwrap();
        let y = results[1].as_ref().unwrap();
        assert_eq!(x.iter().map(|c| c.chunk_id.get()).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(y[0].chunk_id.get(), 2);
    }

    #[tokio::test]
    async fn remove_document_drops_owned_chunks() {
        let store = ChunkStore::default();
        let chunks = store
            .ingest(document("a", "Alpha one here.\n\nAlpha two here."))
            .await
            .unwrap();
        let record = store.remove_document(&DocumentId::new("a")).await.unwrap();

        assert_eq!(record.chunk_ids.len(), 2);
        assert!(store.get(chunks[0].chunk_id).await.is_none());
        assert!(store.chunks_for(&DocumentId::new("a")).await.is_empty());
    }

    #[tokio::test]
    async fn restore_never_reuses_identifiers() {
        let store = ChunkStore::default();
        let chunk = Chunk {
            chunk_id: ChunkId::new(9),
            document_id: DocumentId::new("old"),
            page_number: 1,
            paragraph_index: 0,
            text: "Restored text".into(),
        };
        store.restore(0, Vec::new(), vec![chunk]).await;

        let fresh = store.ingest(document("new", "Fresh text here.")).await.unwrap();
        assert_eq!(fresh[0].chunk_id.get(), 10);
    }
}
