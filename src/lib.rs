#![deny(missing_docs)]

//! Core library for docsynth: grounded question answering and cross-document theme synthesis.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Text extraction collaborators.
pub mod extraction;
/// Exact cosine index over chunk embeddings, with snapshot persistence.
pub mod index;
/// Language-model client abstraction and adapters.
pub mod llm;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Document processing pipeline: chunk store and orchestration.
pub mod processing;
/// Similarity search over indexed chunks.
pub mod retrieval;
/// Per-document grounded answer synthesis.
pub mod synthesis;
/// Cross-document theme aggregation.
pub mod themes;
