//! Per-document answer synthesis.
//!
//! One model call is made per document so that citations stay unambiguous. Every call runs
//! under a [`RetryPolicy`] and a hard timeout; a document whose call still fails is reported as
//! [`SynthesisError::SynthesisFailed`] without affecting its siblings.

mod citations;
mod prompt;
mod retry;

pub use retry::{CallFailure, RetryPolicy, complete_with_policy};

use crate::llm::{LanguageModel, LlmError};
use crate::processing::types::{Citation, DocumentId};
use crate::retrieval::RetrievalResult;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunables shared by the answer and theme stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisSettings {
    /// Retry schedule per model call.
    pub retry: RetryPolicy,
    /// Hard timeout per attempt.
    pub call_timeout: Duration,
    /// Token cap for per-document answers.
    pub max_tokens: u32,
    /// Token cap for the theme pass.
    pub theme_max_tokens: u32,
    /// Token budget for the excerpt section of answer prompts.
    pub prompt_token_budget: usize,
    /// Documents synthesized concurrently.
    pub concurrency: usize,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(60),
            max_tokens: 400,
            theme_max_tokens: 600,
            prompt_token_budget: 3000,
            concurrency: 4,
        }
    }
}

/// A grounded answer from one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    /// Document the answer was synthesized from.
    pub document_id: DocumentId,
    /// Prose answer with validated `[[chunk:<id>]]` markers.
    pub text: String,
    /// Sources, each a chunk that was part of the prompt.
    pub citations: Vec<Citation>,
}

/// Errors raised while answering for a single document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// The retrieval result contained no chunks.
    #[error("no retrieved context to answer from")]
    EmptyContext,
    /// The retrieval result spans more than one document.
    #[error("retrieved context spans {count} documents; answers are per document")]
    MixedDocuments {
        /// Number of distinct documents in the context.
        count: usize,
    },
    /// The model call failed after all retries.
    #[error("synthesis failed for document '{document_id}' after {attempts} attempts: {source}")]
    SynthesisFailed {
        /// Document that could not be answered.
        document_id: DocumentId,
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: LlmError,
    },
}

/// Outcome of synthesis for one document: an answer or the error marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOutcome {
    /// Document the outcome belongs to.
    pub document_id: DocumentId,
    /// Answer, or the reason there is none.
    pub result: Result<Answer, SynthesisError>,
}

impl DocumentOutcome {
    /// The answer when synthesis succeeded.
    pub fn answer(&self) -> Option<&Answer> {
        self.result.as_ref().ok()
    }
}

/// Builds grounded prompts and binds model output back to source chunks.
#[derive(Clone)]
pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
    settings: SynthesisSettings,
}

impl AnswerSynthesizer {
    /// Create a synthesizer around `model`.
    pub fn new(model: Arc<dyn LanguageModel>, settings: SynthesisSettings) -> Self {
        Self { model, settings }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &SynthesisSettings {
        &self.settings
    }

    /// Answer `question` from the chunks of a single-document retrieval result.
    pub async fn answer(
        &self,
        question: &str,
        context: &RetrievalResult,
    ) -> Result<Answer, SynthesisError> {
        let groups = context.by_document();
        let document_id = match groups.as_slice() {
            [] => return Err(SynthesisError::EmptyContext),
            [(document_id, _)] => document_id.clone(),
            many => return Err(SynthesisError::MixedDocuments { count: many.len() }),
        };

        let prompt = prompt::build_answer_prompt(
            question,
            context,
            self.settings.prompt_token_budget,
        );
        let output = complete_with_policy(
            self.model.as_ref(),
            &prompt.text,
            self.settings.max_tokens,
            &self.settings.retry,
            self.settings.call_timeout,
        )
        .await
        .map_err(|failure| {
            tracing::error!(
                document_id = %document_id,
                attempts = failure.attempts,
                error = %failure.error,
                "Answer synthesis failed"
            );
            SynthesisError::SynthesisFailed {
                document_id: document_id.clone(),
                attempts: failure.attempts,
                source: failure.error,
            }
        })?;

        let sent: Vec<_> = prompt.included.iter().map(|chunk| chunk.chunk_id).collect();
        let reconciled = citations::reconcile(&output, &sent);
        if !reconciled.rejected.is_empty() {
            tracing::warn!(
                document_id = %document_id,
                rejected = ?reconciled.rejected,
                "Dropped citations to chunks outside the prompt"
            );
        }

        let citations = if reconciled.cited.is_empty() {
            prompt.included.iter().map(|chunk| chunk.citation()).collect()
        } else {
            reconciled
                .cited
                .iter()
                .filter_map(|chunk_id| {
                    prompt
                        .included
                        .iter()
                        .find(|chunk| chunk.chunk_id == *chunk_id)
                        .map(|chunk| chunk.citation())
                })
                .collect()
        };

        tracing::info!(
            document_id = %document_id,
            chunks = prompt.included.len(),
            citations = reconciled.cited.len(),
            "Synthesized document answer"
        );
        Ok(Answer {
            document_id,
            text: reconciled.text,
            citations,
        })
    }

    /// Answer per document on a bounded pool, one outcome per document in rank order.
    pub async fn answer_documents(
        &self,
        question: &str,
        result: &RetrievalResult,
    ) -> Vec<DocumentOutcome> {
        let concurrency = self.settings.concurrency.max(1);
        stream::iter(result.by_document())
            .map(|(document_id, context)| async move {
                let result = self.answer(question, &context).await;
                DocumentOutcome {
                    document_id,
                    result,
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }
}
