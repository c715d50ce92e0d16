use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and answering activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_indexed: AtomicU64,
    chunks_indexed: AtomicU64,
    documents_rejected: AtomicU64,
    questions_answered: AtomicU64,
    answers_failed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an indexed document and the number of chunks produced for it.
    pub fn record_document(&self, chunk_count: u64) {
        self.documents_indexed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed
            .fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a document that was skipped during ingestion.
    pub fn record_rejected_document(&self) {
        self.documents_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled question along with how many per-document answers failed.
    pub fn record_question(&self, failed_answers: u64) {
        self.questions_answered.fetch_add(1, Ordering::Relaxed);
        self.answers_failed
            .fetch_add(failed_answers, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            documents_rejected: self.documents_rejected.load(Ordering::Relaxed),
            questions_answered: self.questions_answered.load(Ordering::Relaxed),
            answers_failed: self.answers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of documents that have been indexed since startup.
    pub documents_indexed: u64,
    /// Total chunk count produced across all indexed documents.
    pub chunks_indexed: u64,
    /// Documents skipped because extraction, chunking, or indexing failed.
    pub documents_rejected: u64,
    /// Questions that ran through retrieval and synthesis.
    pub questions_answered: u64,
    /// Per-document answers that ended in a synthesis failure.
    pub answers_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = PipelineMetrics::new();
        metrics.record_document(2);
        metrics.record_document(3);
        metrics.record_rejected_document();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_indexed, 2);
        assert_eq!(snapshot.chunks_indexed, 5);
        assert_eq!(snapshot.documents_rejected, 1);
    }

    #[test]
    fn records_questions_and_failures() {
        let metrics = PipelineMetrics::new();
        metrics.record_question(0);
        metrics.record_question(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.questions_answered, 2);
        assert_eq!(snapshot.answers_failed, 2);
    }

    #[test]
    fn snapshot_is_consistent() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
