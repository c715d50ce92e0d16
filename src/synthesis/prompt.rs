//! Prompt assembly for per-document answers.

use crate::processing::types::Chunk;
use crate::retrieval::RetrievalResult;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use tiktoken_rs::{CoreBPE, cl100k_base};

/// A rendered prompt and the chunks whose text it carries.
#[derive(Debug, Clone)]
pub(crate) struct AnswerPrompt {
    pub(crate) text: String,
    pub(crate) included: Vec<Arc<Chunk>>,
}

/// Render the grounded answer prompt.
///
/// The fixed instructions and the question are charged against `token_budget` first; the
/// question may take at most half of what the instructions leave and is shortened past that.
/// Chunks are then admitted in rank order until the next one would exceed the remainder. The
/// first chunk is always admitted, shortened when it alone exceeds it.
pub(crate) fn build_answer_prompt(
    question: &str,
    context: &RetrievalResult,
    token_budget: usize,
) -> AnswerPrompt {
    let available = token_budget.saturating_sub(count_tokens(&render_prompt("", "")));
    let question = question.trim();
    let question_tokens = count_tokens(question);
    let question = if question_tokens > available / 2 {
        tracing::warn!(
            question_tokens,
            token_budget,
            "Question exceeds its share of the prompt budget; truncating"
        );
        truncate_to_tokens(question, available / 2)
    } else {
        question.to_string()
    };
    let excerpt_budget = available.saturating_sub(count_tokens(&question));

    let mut blocks = String::new();
    let mut used = 0;
    let mut included = Vec::new();

    for hit in context.hits() {
        let header = block_header(&hit.chunk);
        let cost = count_tokens(&header) + count_tokens(&hit.chunk.text);
        if !included.is_empty() && used + cost > excerpt_budget {
            tracing::debug!(
                admitted = included.len(),
                dropped = context.len() - included.len(),
                token_budget,
                "Prompt budget reached"
            );
            break;
        }

        let body = if cost > excerpt_budget {
            truncate_to_tokens(
                &hit.chunk.text,
                excerpt_budget.saturating_sub(count_tokens(&header)),
            )
        } else {
            hit.chunk.text.clone()
        };
        let _ = write!(blocks, "{header}\n{body}\n\n");
        used += cost.min(excerpt_budget);
        included.push(Arc::clone(&hit.chunk));
    }

    AnswerPrompt {
        text: render_prompt(&question, &blocks),
        included,
    }
}

fn render_prompt(question: &str, blocks: &str) -> String {
    format!(
        r#"You are answering a question using excerpts from a single document.

Rules:
1) Use ONLY the excerpts below. Do not add outside knowledge.
2) Omit any claim the excerpts do not support. If they do not answer the question, say so briefly.
3) Cite each claim with the marker of the excerpt it comes from, written exactly as [[chunk:<id>]].

Question:
{question}

Excerpts:
{blocks}Answer:
"#
    )
}

fn block_header(chunk: &Chunk) -> String {
    format!(
        "[[chunk:{}]] document=\"{}\" page={} paragraph={}",
        chunk.chunk_id, chunk.document_id, chunk.page_number, chunk.paragraph_index
    )
}

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(encoding) => Some(encoding),
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "Falling back to whitespace token counting"
                );
                None
            }
        })
        .as_ref()
}

/// Count tokens with `cl100k_base`, or whitespace-separated words when unavailable.
pub(crate) fn count_tokens(text: &str) -> usize {
    match encoder() {
        Some(encoding) => encoding.encode_ordinary(text).len(),
        None => text.split_whitespace().count(),
    }
}

fn truncate_to_tokens(text: &str, budget: usize) -> String {
    let mut kept = String::new();
    let mut used = 0;
    for word in text.split_whitespace() {
        let cost = count_tokens(word).max(1);
        if used + cost > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push(' ');
        }
        kept.push_str(word);
        used += cost;
    }
    if kept.is_empty() {
        text.split_whitespace().next().unwrap_or_default().to_string()
    } else {
        kept
    }
}
