//! Document processing pipeline: chunking, storage, and question-answering orchestration.

pub mod chunking;
pub(crate) mod mappers;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod types;

pub use service::{
    AskRequest, AskResponse, DocumentContent, DocumentInput, DocumentPipeline, PipelineError,
    PipelineSettings, ProcessingApi,
};
pub use store::ChunkStore;
pub use types::{
    AskError, Chunk, ChunkError, ChunkId, Citation, Document, DocumentId, DocumentRecord,
    IngestError, IngestReport, IngestSummary, Page,
};
