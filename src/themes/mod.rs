//! Cross-document theme aggregation.
//!
//! Runs once all per-document answers have settled. Successful answers are labelled `D1..Dn`
//! in a single second-stage prompt; the reply is parsed strictly and every document reference
//! is checked against that batch.

mod parser;

use crate::llm::{LanguageModel, LlmError};
use crate::processing::types::DocumentId;
use crate::synthesis::{Answer, DocumentOutcome, SynthesisSettings, complete_with_policy};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

/// A document backing a theme, with the answer it contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThemeSupport {
    /// Supporting document.
    pub document_id: DocumentId,
    /// That document's answer to the question.
    pub answer: Answer,
}

/// A recurring theme across per-document answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Theme {
    /// Short title.
    pub title: String,
    /// One or two sentence description.
    pub summary: String,
    /// Documents that support the theme, in reference order.
    pub supporting: Vec<ThemeSupport>,
}

/// Themes plus the overall answer requested alongside them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThemeReport {
    /// Themes in the order the model listed them.
    pub themes: Vec<Theme>,
    /// Combined answer, when the model produced one.
    pub synthesized_answer: Option<String>,
}

/// Errors raised by [`ThemeAggregator::aggregate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThemeError {
    /// Every document failed synthesis; there is nothing to aggregate.
    #[error("no document answers available for theme aggregation")]
    NoAnswersAvailable,
    /// The theme call failed after all retries.
    #[error("theme synthesis failed after {attempts} attempts: {source}")]
    SynthesisFailed {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        #[source]
        source: LlmError,
    },
}

/// Produces cross-document themes from per-document answers.
#[derive(Clone)]
pub struct ThemeAggregator {
    model: Arc<dyn LanguageModel>,
    settings: SynthesisSettings,
}

impl ThemeAggregator {
    /// Create an aggregator around `model`.
    pub fn new(model: Arc<dyn LanguageModel>, settings: SynthesisSettings) -> Self {
        Self { model, settings }
    }

    /// Aggregate the successful answers among `outcomes` into themes.
    pub async fn aggregate(
        &self,
        question: &str,
        outcomes: &[DocumentOutcome],
    ) -> Result<ThemeReport, ThemeError> {
        let answers: Vec<&Answer> = outcomes
            .iter()
            .filter_map(DocumentOutcome::answer)
            .collect();
        if answers.is_empty() {
            return Err(ThemeError::NoAnswersAvailable);
        }
        let skipped = outcomes.len() - answers.len();
        if skipped > 0 {
            tracing::info!(skipped, "Aggregating themes without failed documents");
        }

        let prompt = theme_prompt(question, &answers);
        let output = complete_with_policy(
            self.model.as_ref(),
            &prompt,
            self.settings.theme_max_tokens,
            &self.settings.retry,
            self.settings.call_timeout,
        )
        .await
        .map_err(|failure| {
            tracing::error!(
                attempts = failure.attempts,
                error = %failure.error,
                "Theme synthesis failed"
            );
            ThemeError::SynthesisFailed {
                attempts: failure.attempts,
                source: failure.error,
            }
        })?;

        let parsed = parser::parse_theme_response(&output);
        let documents: Vec<DocumentId> = answers
            .iter()
            .map(|answer| answer.document_id.clone())
            .collect();

        let mut themes = Vec::with_capacity(parsed.themes.len());
        for theme in parsed.themes {
            let mut positions: Vec<usize> = Vec::new();
            for reference in &theme.references {
                match parser::resolve_reference(reference, &documents) {
                    Some(position) if !positions.contains(&position) => positions.push(position),
                    Some(_) => {}
                    None => tracing::warn!(
                        theme = %theme.title,
                        reference = %reference,
                        "Dropped unknown document reference"
                    ),
                }
            }
            if positions.is_empty() {
                tracing::warn!(theme = %theme.title, "Dropped theme without supporting documents");
                continue;
            }
            themes.push(Theme {
                title: theme.title,
                summary: theme.summary,
                supporting: positions
                    .into_iter()
                    .map(|position| ThemeSupport {
                        document_id: documents[position].clone(),
                        answer: answers[position].clone(),
                    })
                    .collect(),
            });
        }

        tracing::info!(
            themes = themes.len(),
            documents = documents.len(),
            "Aggregated themes"
        );
        Ok(ThemeReport {
            themes,
            synthesized_answer: parsed.synthesized_answer,
        })
    }
}

fn theme_prompt(question: &str, answers: &[&Answer]) -> String {
    let mut sections = String::new();
    for (position, answer) in answers.iter().enumerate() {
        let _ = write!(
            sections,
            "[D{}] document=\"{}\"\n{}\n\n",
            position + 1,
            answer.document_id,
            answer.text.trim()
        );
    }

    format!(
        r#"Analyze the following answers to a single question. Each answer comes from a different document.

Question:
{question}

Answers:
{sections}Instructions:
1) Identify 1-3 themes that recur across the answers. Use ONLY what the answers say.
2) For each theme give a short title (3-5 words), a one or two sentence summary, and the labels of the documents that support it (for example D1, D3).
3) Finish with a synthesized answer that combines the themes.

Format strictly as:

THEMES:
1. <Theme title>
   - <Summary>
   - Documents: D1, D3

SYNTHESIZED ANSWER:
<Combined answer>
"#,
        question = question.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::{RetryPolicy, SynthesisError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        reply: Result<String, LlmError>,
        prompts: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(reply: Result<String, LlmError>) -> Self {
            Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Recording {
        fn model(&self) -> &str {
            "recording"
        }

        async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone()
        }
    }

    fn settings() -> SynthesisSettings {
        SynthesisSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..SynthesisSettings::default()
        }
    }

    fn success(document: &str, text: &str) -> DocumentOutcome {
        DocumentOutcome {
            document_id: DocumentId::new(document),
            result: Ok(Answer {
                document_id: DocumentId::new(document),
                text: text.into(),
                citations: Vec::new(),
            }),
        }
    }

    fn failure(document: &str) -> DocumentOutcome {
        DocumentOutcome {
            document_id: DocumentId::new(document),
            result: Err(SynthesisError::SynthesisFailed {
                document_id: DocumentId::new(document),
                attempts: 2,
                source: LlmError::Timeout(Duration::from_secs(1)),
            }),
        }
    }

    #[tokio::test]
    async fn all_failed_documents_is_an_error() {
        let aggregator = ThemeAggregator::new(Arc::new(Recording::new(Ok("x".into()))), settings());
        let error = aggregator
            .aggregate("Q?", &[failure("a"), failure("b")])
            .await
            .unwrap_err();
        assert_eq!(error, ThemeError::NoAnswersAvailable);

        let error = aggregator.aggregate("Q?", &[]).await.unwrap_err();
        assert_eq!(error, ThemeError::NoAnswersAvailable);
    }

    #[tokio::test]
    async fn failed_documents_are_left_out_of_the_prompt() {
        let model = Arc::new(Recording::new(Ok(
            "THEMES:\n1. Energy Prices\n   - Prices rose.\n   - Documents: D1\n\nSYNTHESIZED ANSWER:\nPrices rose.".into(),
        )));
        let aggregator = ThemeAggregator::new(model.clone(), settings());
        let report = aggregator
            .aggregate("Q?", &[success("a", "Prices rose sharply."), failure("b")])
            .await
            .unwrap();

        assert_eq!(report.themes.len(), 1);
        assert_eq!(report.themes[0].supporting[0].document_id.as_str(), "a");
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("[D1] document=\"a\""));
        assert!(!prompts[0].contains("document=\"b\""));
    }

    #[tokio::test]
    async fn unknown_references_and_unsupported_themes_are_dropped() {
        let reply = "THEMES:\n1. Shared Theme\n   - Both agree.\n   - Documents: D1, D2, D9, mystery.pdf\n\n2. Phantom Theme\n   - Nobody said this.\n   - Documents: D7\n\nSYNTHESIZED ANSWER:\nThey agree.";
        let aggregator =
            ThemeAggregator::new(Arc::new(Recording::new(Ok(reply.into()))), settings());
        let report = aggregator
            .aggregate("Q?", &[success("a", "Yes."), success("b", "Also yes.")])
            .await
            .unwrap();

        assert_eq!(report.themes.len(), 1);
        let supporting: Vec<&str> = report.themes[0]
            .supporting
            .iter()
            .map(|support| support.document_id.as_str())
            .collect();
        assert_eq!(supporting, vec!["a", "b"]);
        assert_eq!(report.synthesized_answer.as_deref(), Some("They agree."));
    }

    #[tokio::test]
    async fn theme_call_failure_is_reported() {
        let aggregator = ThemeAggregator::new(
            Arc::new(Recording::new(Err(LlmError::Unavailable("down".into())))),
            settings(),
        );
        let error = aggregator
            .aggregate("Q?", &[success("a", "Yes.")])
            .await
            .unwrap_err();
        assert!(matches!(error, ThemeError::SynthesisFailed { attempts: 2, .. }));
    }
}
