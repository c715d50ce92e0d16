//! OpenAI-compatible `/v1/chat/completions` backend.

use super::{LanguageModel, LlmError, error_for_status, http_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

/// Language model behind an OpenAI-compatible chat completions API.
pub struct OpenAiLanguageModel {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiLanguageModel {
    /// Construct a client for `model` at `base_url` authenticated with `api_key`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            http: http_client("docsynth/llm")?,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "temperature": 0.1,
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                LlmError::Unavailable(format!(
                    "failed to reach {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &headers, &body));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            LlmError::MalformedResponse(format!("failed to decode chat response: {error}"))
        })?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| LlmError::MalformedResponse("response contained no choices".into()))
    }
}
