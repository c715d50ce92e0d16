//! Bounded retry with exponential backoff around language-model calls.

use crate::llm::{LanguageModel, LlmError};
use std::time::Duration;

/// Attempts and backoff schedule for one logical model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Values below one are treated as one.
    pub max_attempts: u32,
    /// Wait before the second attempt; doubled for each later attempt.
    pub base_delay: Duration,
    /// Upper bound on the computed backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based) after `error`.
    ///
    /// A provider `retry_after` hint is honoured even when it exceeds the computed backoff.
    pub fn delay_for(&self, retry: u32, error: &LlmError) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        error
            .retry_after()
            .map_or(backoff, |hint| backoff.max(hint))
    }
}

/// Final failure of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error of the last attempt.
    pub error: LlmError,
}

/// Call `model` under `policy`, bounding every attempt by `call_timeout`.
///
/// Blank completions count as [`LlmError::MalformedResponse`] and are retried.
pub async fn complete_with_policy(
    model: &dyn LanguageModel,
    prompt: &str,
    max_tokens: u32,
    policy: &RetryPolicy,
    call_timeout: Duration,
) -> Result<String, CallFailure> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match tokio::time::timeout(call_timeout, model.complete(prompt, max_tokens))
            .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text),
            Ok(Ok(_)) => LlmError::MalformedResponse("model returned an empty completion".into()),
            Ok(Err(error)) => error,
            Err(_) => LlmError::Timeout(call_timeout),
        };

        if attempt >= max_attempts {
            return Err(CallFailure { attempts: attempt, error });
        }

        let delay = policy.delay_for(attempt, &error);
        tracing::warn!(
            model = model.model(),
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Language model call failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
