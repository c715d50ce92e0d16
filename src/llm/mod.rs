//! Language-model collaborators.
//!
//! The pipeline only ever calls [`LanguageModel::complete`]. Two HTTP backends are provided:
//! a local Ollama runtime and any OpenAI-compatible chat completions endpoint.

mod ollama;
mod openai;

pub use ollama::OllamaLanguageModel;
pub use openai::OpenAiLanguageModel;

use crate::config::{Config, LlmProvider};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transient failures of a language-model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    /// The call did not finish within the configured timeout.
    #[error("language model call timed out after {0:?}")]
    Timeout(Duration),
    /// The provider throttled the request.
    #[error("language model rate limited the request")]
    RateLimited {
        /// Wait requested by the provider.
        retry_after: Option<Duration>,
    },
    /// The provider could not be reached or failed internally.
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with something unusable.
    #[error("malformed language model response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Minimum wait the provider asked for before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Text-completion interface implemented by model backends.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, used in logs.
    fn model(&self) -> &str;

    /// Complete `prompt`, producing at most roughly `max_tokens` tokens.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;
}

/// Build the configured backend for `model`.
pub fn build_language_model(
    config: &Config,
    model: &str,
) -> Result<Arc<dyn LanguageModel>, LlmError> {
    match config.llm_provider {
        LlmProvider::Ollama => Ok(Arc::new(OllamaLanguageModel::new(
            config.ollama_url.clone(),
            model,
        )?)),
        LlmProvider::OpenAI => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                LlmError::Unavailable("OPENAI_API_KEY is not configured".into())
            })?;
            Ok(Arc::new(OpenAiLanguageModel::new(
                config.openai_base_url.clone(),
                api_key,
                model,
            )?))
        }
    }
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &str) -> LlmError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimited {
            retry_after: parse_retry_after(headers),
        };
    }
    LlmError::Unavailable(format!("provider returned {status}: {}", body.trim()))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64)
}

pub(crate) fn http_client(user_agent: &str) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|error| LlmError::Unavailable(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn too_many_requests_maps_to_rate_limited_with_hint() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        let error = error_for_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(
            error,
            LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn server_errors_map_to_unavailable() {
        let error = error_for_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), " boom ");
        assert!(matches!(error, LlmError::Unavailable(ref message) if message.contains("502") && message.ends_with("boom")));
        assert_eq!(error.retry_after(), None);
    }
}
