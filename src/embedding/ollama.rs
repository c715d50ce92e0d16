//! Ollama-backed embedding client (`POST /api/embed`).

use super::{EmbeddingClient, EmbeddingClientError, EmbeddingSpace, normalize};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Embedding client issuing requests to a local Ollama runtime.
pub struct OllamaEmbeddingClient {
    http: Client,
    base_url: String,
    space: EmbeddingSpace,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingClient {
    /// Provider name recorded in the embedding space.
    pub const PROVIDER: &'static str = "ollama";

    /// Construct a client for `model`, expecting vectors of `dimension` entries.
    ///
    /// Each request is abandoned after `timeout` and reported as
    /// [`EmbeddingClientError::ProviderUnavailable`].
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingClientError> {
        let http = Client::builder()
            .user_agent("docsynth/embed")
            .timeout(timeout)
            .build()
            .map_err(|error| EmbeddingClientError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            space: EmbeddingSpace::new(Self::PROVIDER, model, dimension),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();
        let payload = json!({
            "model": self.space.model,
            "input": texts,
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                EmbeddingClientError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(EmbeddingClientError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: EmbedResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                EmbeddingClientError::ProviderUnavailable(format!(
                    "Ollama response timed out: {error}"
                ))
            } else {
                EmbeddingClientError::InvalidResponse(format!(
                    "failed to decode Ollama response: {error}"
                ))
            }
        })?;

        if body.embeddings.len() != expected {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "expected {expected} embeddings, received {}",
                body.embeddings.len()
            )));
        }

        let mut embeddings = body.embeddings;
        for vector in &mut embeddings {
            normalize(vector);
        }
        Ok(embeddings)
    }
}
