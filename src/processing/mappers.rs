//! Mapping helpers for document records and content digests.

use super::types::{ChunkId, Document, DocumentRecord};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Compute a deterministic SHA-256 hash for a piece of text.
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Current timestamp formatted for record storage.
pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Build the stored record for a freshly chunked document.
pub(crate) fn build_document_record(document: &Document, chunk_ids: Vec<ChunkId>) -> DocumentRecord {
    let full_text = document
        .pages
        .iter()
        .map(|page| page.blocks.join("\n\n"))
        .collect::<Vec<_>>()
        .join("\u{c}");

    DocumentRecord {
        id: document.id.clone(),
        name: document.name.clone(),
        mime_type: document.mime_type.clone(),
        page_count: document.pages.len(),
        chunk_ids,
        ingested_at: current_timestamp_rfc3339(),
        fingerprint: compute_content_hash(&full_text),
    }
}
