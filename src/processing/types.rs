//! Core data types and error definitions for the processing pipeline.

use crate::{
    extraction::{ExtractedPage, ExtractionError},
    index::IndexError,
    retrieval::SearchError,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of an ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a raw identifier, trimming surrounding whitespace.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.len() == raw.len() {
            Self(raw)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is blank.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-scoped, monotonically assigned chunk identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    /// Wrap a raw numeric identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of a document as an ordered list of raw text blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number reported by extraction.
    pub number: u32,
    /// Raw text blocks in reading order.
    pub blocks: Vec<String>,
}

impl Page {
    /// Page holding a single block of extracted text.
    pub fn from_text(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            blocks: vec![text.into()],
        }
    }

    /// Whether any block carries non-whitespace text.
    pub fn has_text(&self) -> bool {
        self.blocks.iter().any(|block| !block.trim().is_empty())
    }
}

/// A document after extraction, immutable once handed to the chunk store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document identity.
    pub id: DocumentId,
    /// Human-readable name (typically the file name).
    pub name: String,
    /// MIME type the content was extracted from.
    pub mime_type: String,
    /// Pages in document order.
    pub pages: Vec<Page>,
}

impl Document {
    /// Assemble a document from the extraction collaborator's page sequence.
    pub fn from_extracted(
        id: DocumentId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        pages: Vec<ExtractedPage>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            mime_type: mime_type.into(),
            pages: pages
                .into_iter()
                .map(|page| Page::from_text(page.page_number, page.text))
                .collect(),
        }
    }

    /// Whether extraction produced any non-whitespace text.
    pub fn has_text(&self) -> bool {
        self.pages.iter().any(Page::has_text)
    }
}

/// Retrieval unit with provenance back to its owning document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier assigned by the chunk store.
    pub chunk_id: ChunkId,
    /// Owning document (back-reference only).
    pub document_id: DocumentId,
    /// Page the chunk was cut from.
    pub page_number: u32,
    /// 0-based position of the chunk within its page.
    pub paragraph_index: u32,
    /// Trimmed, non-empty chunk text.
    pub text: String,
}

impl Chunk {
    /// Citation pointing back at this chunk.
    pub fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.chunk_id,
            document_id: self.document_id.clone(),
            page_number: self.page_number,
            paragraph_index: self.paragraph_index,
        }
    }
}

/// Source reference attached to a synthesized answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Chunk whose text was sent to the model.
    pub chunk_id: ChunkId,
    /// Document owning the chunk.
    pub document_id: DocumentId,
    /// Page of the cited chunk.
    pub page_number: u32,
    /// Paragraph position of the cited chunk within its page.
    pub paragraph_index: u32,
}

/// Metadata retained for every stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document identity.
    pub id: DocumentId,
    /// Human-readable name.
    pub name: String,
    /// MIME type of the original content.
    pub mime_type: String,
    /// Number of pages reported by extraction.
    pub page_count: usize,
    /// Chunks owned by the document, in document order.
    pub chunk_ids: Vec<ChunkId>,
    /// RFC 3339 ingestion timestamp.
    pub ingested_at: String,
    /// SHA-256 digest of the extracted text.
    pub fingerprint: String,
}

/// Errors raised while turning a document into chunks.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Extraction yielded no non-whitespace text.
    #[error("document '{document_id}' contains no extractable text")]
    EmptyDocument {
        /// Offending document.
        document_id: DocumentId,
    },
    /// A document with the same identifier is already stored.
    #[error("document '{document_id}' is already ingested")]
    DuplicateDocument {
        /// Offending document.
        document_id: DocumentId,
    },
    /// The document identifier is blank.
    #[error("document identifier must not be empty")]
    InvalidDocumentId,
}

/// Per-document ingestion failure.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Text extraction rejected the content.
    #[error("Failed to extract text: {0}")]
    Extraction(#[from] ExtractionError),
    /// Chunking rejected the document.
    #[error("Failed to chunk document: {0}")]
    Chunking(#[from] ChunkError),
    /// Embedding or index write failed.
    #[error("Failed to index document: {0}")]
    Index(#[from] IndexError),
    /// No stored document carries the identifier.
    #[error("document '{0}' not found")]
    UnknownDocument(DocumentId),
}

impl IngestError {
    /// Whether the failure must abort the whole indexing operation rather than one document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Index(error) if error.is_fatal())
    }
}

/// Failures that abort a question before any synthesis happens.
#[derive(Debug, Error)]
pub enum AskError {
    /// Query validation or index lookup failed.
    #[error("Search failed: {0}")]
    Search(#[from] SearchError),
}

/// Outcome of ingesting a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Document that was indexed.
    pub document_id: DocumentId,
    /// Pages reported by extraction.
    pub page_count: usize,
    /// Chunks produced and indexed.
    pub chunk_count: usize,
}

/// Per-document entry of a batch ingestion report.
#[derive(Debug)]
pub struct IngestReport {
    /// Document the entry refers to.
    pub document_id: DocumentId,
    /// Success summary or the error that caused the document to be skipped.
    pub result: Result<IngestSummary, IngestError>,
}
