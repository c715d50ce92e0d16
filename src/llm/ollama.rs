//! Ollama `/api/generate` backend.

use super::{LanguageModel, LlmError, error_for_status, http_client};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

/// Language model served by a local Ollama runtime.
pub struct OllamaLanguageModel {
    http: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    done: bool,
}

impl OllamaLanguageModel {
    /// Construct a client for `model` at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        Ok(Self {
            http: http_client("docsynth/llm")?,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for OllamaLanguageModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_predict": max_tokens,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                LlmError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(LlmError::Unavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &headers, &body));
        }

        let body: GenerateResponse = response.json().await.map_err(|error| {
            LlmError::MalformedResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(LlmError::MalformedResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.response.trim().to_string())
    }
}
