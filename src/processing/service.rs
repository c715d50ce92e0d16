//! Pipeline service coordinating extraction, chunking, indexing, retrieval and synthesis.

use crate::{
    config::Config,
    embedding::{EmbeddingClient, EmbeddingClientError, build_embedding_client},
    extraction::{ExtractedPage, PlainTextExtractor, TextExtractor},
    index::{
        EmbeddingIndex,
        snapshot::{Snapshot, SnapshotError, read_snapshot, write_snapshot},
    },
    llm::{LanguageModel, LlmError, build_language_model},
    metrics::{MetricsSnapshot, PipelineMetrics},
    processing::{
        chunking::ChunkPolicy,
        sanitize::sanitize_document_id,
        store::{ChunkStore, PreparedDocument},
        types::{
            AskError, Chunk, ChunkError, Document, DocumentId, DocumentRecord, IngestError,
            IngestReport, IngestSummary,
        },
    },
    retrieval::{RetrievalResult, Retriever, SearchError},
    synthesis::{AnswerSynthesizer, DocumentOutcome, SynthesisSettings},
    themes::{ThemeAggregator, ThemeError, ThemeReport},
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Tunables for the orchestration service.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Chunk boundary thresholds.
    pub chunk_policy: ChunkPolicy,
    /// Answer and theme stage settings.
    pub synthesis: SynthesisSettings,
    /// Documents extracted and chunked concurrently in a batch.
    pub ingest_concurrency: usize,
    /// `top_k` used when a question does not specify one.
    pub default_limit: usize,
    /// Largest accepted `top_k`; larger requests are clamped.
    pub max_limit: usize,
    /// `min_score` used when a question does not specify one.
    pub default_min_score: f32,
    /// Snapshot file written after every mutation, when set.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::default(),
            synthesis: SynthesisSettings::default(),
            ingest_concurrency: 4,
            default_limit: 10,
            max_limit: 50,
            default_min_score: 0.2,
            snapshot_path: None,
        }
    }
}

/// Errors raised while assembling a pipeline from configuration.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The embedding client could not be built.
    #[error("Failed to initialize embedding client: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// A language-model client could not be built.
    #[error("Failed to initialize language model: {0}")]
    Llm(#[from] LlmError),
    /// The configured snapshot could not be loaded.
    #[error("Failed to load index snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// How the content of an incoming document is supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    /// Raw bytes to run through the extraction collaborator.
    Raw {
        /// Document bytes.
        bytes: Vec<u8>,
        /// MIME type of `bytes`.
        mime_type: String,
    },
    /// Pages already extracted by the caller.
    Pages(Vec<ExtractedPage>),
}

/// A document submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInput {
    /// Explicit identifier; the name is used when absent.
    pub id: Option<String>,
    /// Display name, typically the file name.
    pub name: String,
    /// Content to extract and chunk.
    pub content: DocumentContent,
}

impl DocumentInput {
    /// Plain UTF-8 text submitted under `name`.
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            content: DocumentContent::Raw {
                bytes: text.into().into_bytes(),
                mime_type: "text/plain".into(),
            },
        }
    }

    /// Pre-extracted pages submitted under `name`.
    pub fn pages(name: impl Into<String>, pages: Vec<ExtractedPage>) -> Self {
        Self {
            id: None,
            name: name.into(),
            content: DocumentContent::Pages(pages),
        }
    }

    /// Override the identifier derived from the name.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn mime_type(&self) -> &str {
        match &self.content {
            DocumentContent::Raw { mime_type, .. } => mime_type,
            DocumentContent::Pages(_) => "text/plain",
        }
    }
}

/// A question to answer across the indexed documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AskRequest {
    /// Natural-language question.
    pub question: String,
    /// Number of chunks to retrieve; must be positive.
    pub top_k: Option<i64>,
    /// Minimum cosine score in `[-1, 1]`.
    pub min_score: Option<f32>,
    /// Restrict retrieval to these documents. An empty list restricts nothing.
    pub documents: Option<Vec<DocumentId>>,
}

impl AskRequest {
    /// Ask `question` with default retrieval parameters.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

/// Everything produced for one question.
#[derive(Debug, Clone)]
pub struct AskResponse {
    /// The question as asked.
    pub question: String,
    /// Ranked retrieval hits the answers were built from.
    pub retrieved: RetrievalResult,
    /// One outcome per document that had retrieved chunks.
    pub answers: Vec<DocumentOutcome>,
    /// Cross-document themes, or why there are none.
    pub themes: Result<ThemeReport, ThemeError>,
}

/// Abstraction over the pipeline used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait ProcessingApi: Send + Sync {
    /// Extract, chunk and index one document.
    async fn ingest_document(&self, input: DocumentInput) -> Result<IngestSummary, IngestError>;

    /// Retrieve, answer per document and aggregate themes.
    async fn ask(&self, request: AskRequest) -> Result<AskResponse, AskError>;

    /// Records of every stored document.
    async fn list_documents(&self) -> Vec<DocumentRecord>;

    /// Remove a document and its chunks from the store and the index.
    async fn delete_document(&self, document_id: &DocumentId)
    -> Result<DocumentRecord, IngestError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Owns the store, index and synthesis stages and runs the full question-answering flow.
///
/// Writers (ingest, delete, snapshot) are serialized by an internal lock so that chunk
/// registration and index upserts of one operation are never interleaved with another's.
/// Questions run concurrently with each other and only contend on the index read lock.
pub struct DocumentPipeline {
    store: Arc<ChunkStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Arc<dyn TextExtractor>,
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
    themes: ThemeAggregator,
    metrics: Arc<PipelineMetrics>,
    settings: PipelineSettings,
    write_lock: Mutex<()>,
}

impl DocumentPipeline {
    /// Assemble a pipeline from explicit collaborators.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        answer_model: Arc<dyn LanguageModel>,
        theme_model: Arc<dyn LanguageModel>,
        extractor: Arc<dyn TextExtractor>,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(ChunkStore::new(settings.chunk_policy));
        let index = Arc::new(EmbeddingIndex::new());
        let retriever = Retriever::new(store.clone(), index.clone(), embedder.clone());
        Self {
            retriever,
            synthesizer: AnswerSynthesizer::new(answer_model, settings.synthesis),
            themes: ThemeAggregator::new(theme_model, settings.synthesis),
            store,
            index,
            embedder,
            extractor,
            metrics: Arc::new(PipelineMetrics::new()),
            settings,
            write_lock: Mutex::new(()),
        }
    }

    /// Build the pipeline described by `config`, restoring its snapshot when one exists.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        tracing::info!("Initializing embedding client");
        let embedder = build_embedding_client(config)?;
        tracing::info!(space = %embedder.space(), "Embedding client initialized");

        let answer_model = build_language_model(config, &config.llm_model)?;
        let theme_model = match config.theme_model.as_deref() {
            Some(model) if model != config.llm_model => build_language_model(config, model)?,
            _ => answer_model.clone(),
        };

        let pipeline = Self::new(
            embedder,
            answer_model,
            theme_model,
            Arc::new(PlainTextExtractor::new()),
            config.pipeline_settings(),
        );
        pipeline.load_snapshot().await?;
        Ok(pipeline)
    }

    /// Shared chunk store.
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Shared embedding index.
    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    /// Settings in effect.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Ingest a single document.
    pub async fn ingest(&self, input: DocumentInput) -> Result<IngestSummary, IngestError> {
        let mut reports = self.ingest_batch(vec![input]).await?;
        match reports.pop() {
            Some(report) => report.result,
            None => Err(ChunkError::InvalidDocumentId.into()),
        }
    }

    /// Ingest many documents, isolating per-document failures.
    ///
    /// Extraction and chunking run concurrently; identifiers are then reserved per document in
    /// input order. A fatal index error (embedding-space or dimension mismatch) rolls back every
    /// document of the batch and is returned as the error of the whole call.
    pub async fn ingest_batch(
        &self,
        inputs: Vec<DocumentInput>,
    ) -> Result<Vec<IngestReport>, IngestError> {
        let concurrency = self.settings.ingest_concurrency.max(1);
        let prepared: Vec<(DocumentId, Result<PreparedDocument, IngestError>)> =
            stream::iter(inputs)
                .map(|input| self.prepare(input))
                .buffered(concurrency)
                .collect()
                .await;

        let _guard = self.write_lock.lock().await;

        let mut entries = Vec::with_capacity(prepared.len());
        let mut ready = Vec::new();
        for (document_id, result) in prepared {
            match result {
                Ok(document) => {
                    entries.push((document_id, None));
                    ready.push(document);
                }
                Err(error) => entries.push((document_id, Some(error))),
            }
        }

        let ready_ids: Vec<DocumentId> = ready
            .iter()
            .map(|document| document.document_id().clone())
            .collect();
        let page_counts: Vec<usize> = ready.iter().map(PreparedDocument::page_count).collect();
        let committed = self.store.commit_batch(ready).await;
        let batch: Vec<DocumentId> = ready_ids
            .into_iter()
            .zip(&committed)
            .filter(|(_, result)| result.is_ok())
            .map(|(document_id, _)| document_id)
            .collect();

        let mut committed = committed.into_iter().zip(page_counts);
        let mut reports = Vec::with_capacity(entries.len());
        for (document_id, failure) in entries {
            let result = match failure {
                Some(error) => Err(error),
                None => match committed.next() {
                    Some((Ok(chunks), page_count)) => {
                        match self.index_chunks(&document_id, &chunks).await {
                            Ok(()) => Ok(IngestSummary {
                                document_id: document_id.clone(),
                                page_count,
                                chunk_count: chunks.len(),
                            }),
                            Err(error) if error.is_fatal() => {
                                tracing::error!(
                                    document_id = %document_id,
                                    error = %error,
                                    documents = batch.len(),
                                    "Fatal index error; rolling back batch"
                                );
                                for committed_id in &batch {
                                    self.rollback(committed_id).await;
                                }
                                return Err(error);
                            }
                            Err(error) => Err(error),
                        }
                    }
                    Some((Err(error), _)) => Err(error.into()),
                    None => Err(ChunkError::InvalidDocumentId.into()),
                },
            };
            reports.push(IngestReport {
                document_id,
                result,
            });
        }

        for report in &reports {
            match &report.result {
                Ok(summary) => {
                    self.metrics.record_document(summary.chunk_count as u64);
                    tracing::info!(
                        document_id = %summary.document_id,
                        pages = summary.page_count,
                        chunks = summary.chunk_count,
                        "Document indexed"
                    );
                }
                Err(error) => {
                    self.metrics.record_rejected_document();
                    tracing::warn!(
                        document_id = %report.document_id,
                        error = %error,
                        "Document skipped"
                    );
                }
            }
        }

        if reports.iter().any(|report| report.result.is_ok()) {
            self.persist().await;
        }
        Ok(reports)
    }

    /// Answer a question across the indexed documents.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, AskError> {
        let AskRequest {
            question,
            top_k,
            min_score,
            documents,
        } = request;

        let requested = top_k.unwrap_or(self.settings.default_limit as i64);
        if requested <= 0 {
            return Err(SearchError::InvalidQuery(format!(
                "top_k must be greater than zero, got {requested}"
            ))
            .into());
        }
        let k = usize::try_from(requested)
            .unwrap_or(usize::MAX)
            .min(self.settings.max_limit.max(1));
        let min_score = min_score.unwrap_or(self.settings.default_min_score);
        tracing::debug!(k, min_score, requested, "Derived retrieval parameters");

        let retrieved = self
            .retriever
            .search_filtered(&question, k, min_score, documents.as_deref())
            .await?;

        let answers = self
            .synthesizer
            .answer_documents(&question, &retrieved)
            .await;
        let failed = answers.iter().filter(|outcome| outcome.answer().is_none()).count();

        let themes = self.themes.aggregate(&question, &answers).await;
        if let Err(error) = &themes {
            tracing::warn!(error = %error, "No themes for question");
        }

        self.metrics.record_question(failed as u64);
        tracing::info!(
            hits = retrieved.len(),
            documents = answers.len(),
            failed,
            "Question answered"
        );

        Ok(AskResponse {
            question,
            retrieved,
            answers,
            themes,
        })
    }

    /// Remove a document, its chunks and their index entries.
    pub async fn delete_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<DocumentRecord, IngestError> {
        let _guard = self.write_lock.lock().await;
        let record = self
            .store
            .remove_document(document_id)
            .await
            .ok_or_else(|| IngestError::UnknownDocument(document_id.clone()))?;
        let removed = self.index.remove(&record.chunk_ids).await;
        tracing::info!(
            document_id = %document_id,
            chunks = record.chunk_ids.len(),
            index_entries = removed,
            "Document deleted"
        );
        self.persist().await;
        Ok(record)
    }

    /// Records of every stored document, ordered by identifier.
    pub async fn documents(&self) -> Vec<DocumentRecord> {
        self.store.documents().await
    }

    /// Current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Write the configured snapshot. Returns `false` when no snapshot path is set.
    pub async fn save_snapshot(&self) -> Result<bool, SnapshotError> {
        let Some(path) = &self.settings.snapshot_path else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        let snapshot = Snapshot::capture(&self.store, &self.index).await;
        write_snapshot(path, &snapshot).await?;
        Ok(true)
    }

    /// Replace pipeline state with the configured snapshot. Returns `false` when there is none.
    pub async fn load_snapshot(&self) -> Result<bool, SnapshotError> {
        let Some(path) = &self.settings.snapshot_path else {
            return Ok(false);
        };
        let Some(snapshot) = read_snapshot(path).await? else {
            tracing::debug!(path = %path.display(), "No snapshot to load");
            return Ok(false);
        };

        if let Some(space) = snapshot
            .embedding_space
            .as_ref()
            .filter(|space| *space != self.embedder.space())
        {
            tracing::warn!(
                snapshot_space = %space,
                client_space = %self.embedder.space(),
                "Snapshot was built with a different embedding space; writes and queries will be rejected"
            );
        }

        let _guard = self.write_lock.lock().await;
        let documents = snapshot.documents.len();
        snapshot.restore_into(&self.store, &self.index).await?;
        tracing::info!(path = %path.display(), documents, "Loaded index snapshot");
        Ok(true)
    }

    async fn prepare(
        &self,
        input: DocumentInput,
    ) -> (DocumentId, Result<PreparedDocument, IngestError>) {
        let Some(document_id) = sanitize_document_id(input.id.clone(), &input.name) else {
            return (
                DocumentId::new(input.name.clone()),
                Err(ChunkError::InvalidDocumentId.into()),
            );
        };

        let mime_type = input.mime_type().to_string();
        let pages = match input.content {
            DocumentContent::Pages(pages) => pages,
            DocumentContent::Raw { bytes, mime_type } => {
                match self.extractor.extract_text(&bytes, &mime_type).await {
                    Ok(pages) => pages,
                    Err(error) => return (document_id, Err(error.into())),
                }
            }
        };

        let document = Document::from_extracted(document_id.clone(), input.name, mime_type, pages);
        let prepared = self.store.prepare(document).map_err(IngestError::from);
        (document_id, prepared)
    }

    async fn index_chunks(
        &self,
        document_id: &DocumentId,
        chunks: &[Arc<Chunk>],
    ) -> Result<(), IngestError> {
        match self.index.add(self.embedder.as_ref(), chunks).await {
            Ok(summary) => {
                tracing::debug!(
                    document_id = %document_id,
                    inserted = summary.inserted,
                    replaced = summary.replaced,
                    "Indexed document chunks"
                );
                Ok(())
            }
            Err(error) => {
                self.rollback(document_id).await;
                Err(error.into())
            }
        }
    }

    async fn rollback(&self, document_id: &DocumentId) {
        if let Some(record) = self.store.remove_document(document_id).await {
            self.index.remove(&record.chunk_ids).await;
        }
    }

    async fn persist(&self) {
        let Some(path) = &self.settings.snapshot_path else {
            return;
        };
        let snapshot = Snapshot::capture(&self.store, &self.index).await;
        if let Err(error) = write_snapshot(path, &snapshot).await {
            tracing::warn!(path = %path.display(), error = %error, "Failed to persist snapshot");
        }
    }
}

#[async_trait]
impl ProcessingApi for DocumentPipeline {
    async fn ingest_document(&self, input: DocumentInput) -> Result<IngestSummary, IngestError> {
        self.ingest(input).await
    }

    async fn ask(&self, request: AskRequest) -> Result<AskResponse, AskError> {
        DocumentPipeline::ask(self, request).await
    }

    async fn list_documents(&self) -> Vec<DocumentRecord> {
        self.documents().await
    }

    async fn delete_document(
        &self,
        document_id: &DocumentId,
    ) -> Result<DocumentRecord, IngestError> {
        DocumentPipeline::delete_document(self, document_id).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        DocumentPipeline::metrics_snapshot(self)
    }
}
