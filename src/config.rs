use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::processing::chunking::ChunkPolicy;
use crate::processing::service::PipelineSettings;
use crate::synthesis::{RetryPolicy, SynthesisSettings};

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the docsynth server and CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Timeout applied to every embedding request.
    pub embedding_timeout_secs: u64,
    /// Language-model backend used for answer and theme synthesis.
    pub llm_provider: LlmProvider,
    /// Model used for per-document answers.
    pub llm_model: String,
    /// Model used for the theme pass; falls back to `llm_model`.
    pub theme_model: Option<String>,
    /// Base URL of the Ollama runtime.
    pub ollama_url: String,
    /// Base URL of an OpenAI-compatible endpoint.
    pub openai_base_url: String,
    /// API key for the OpenAI-compatible endpoint.
    pub openai_api_key: Option<String>,
    /// Hard timeout applied to every language-model call.
    pub llm_timeout_secs: u64,
    /// Token cap for per-document answers.
    pub llm_max_tokens: u32,
    /// Token cap for the theme pass.
    pub theme_max_tokens: u32,
    /// Total attempts per language-model call (first try included).
    pub llm_retry_attempts: u32,
    /// Initial backoff between attempts, doubled on every retry.
    pub llm_retry_base_delay_ms: u64,
    /// Upper bound on concurrently synthesized documents.
    pub synthesis_concurrency: usize,
    /// Upper bound on documents extracted and chunked concurrently.
    pub ingest_concurrency: usize,
    /// Token budget for a whole answer prompt: instructions, question and excerpts.
    pub prompt_token_budget: usize,
    /// Units with fewer words are merged into their successor.
    pub chunk_min_words: usize,
    /// Units longer than this are split at a sentence boundary.
    pub chunk_max_chars: usize,
    /// Number of chunks retrieved when the caller does not specify `top_k`.
    pub search_default_limit: usize,
    /// Largest `top_k` a caller may request.
    pub search_max_limit: usize,
    /// Minimum cosine score applied when the caller does not specify one.
    pub search_default_min_score: f32,
    /// Optional JSON snapshot location for the index.
    pub index_snapshot_path: Option<PathBuf>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Offline feature-hashing embeddings.
    Hashing,
    /// Local Ollama runtime.
    Ollama,
}

/// Supported language-model backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Local Ollama runtime (`/api/generate`).
    Ollama,
    /// OpenAI-compatible chat completions API.
    OpenAI,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_provider = load_env_optional("LLM_PROVIDER")
            .map(|value| {
                value
                    .parse()
                    .map_err(|()| ConfigError::InvalidValue("LLM_PROVIDER".into()))
            })
            .transpose()?
            .unwrap_or(LlmProvider::Ollama);
        let openai_api_key = load_env_optional("OPENAI_API_KEY");
        if llm_provider == LlmProvider::OpenAI && openai_api_key.is_none() {
            return Err(ConfigError::MissingVariable("OPENAI_API_KEY".into()));
        }

        let config = Self {
            embedding_provider: parse_required("EMBEDDING_PROVIDER")?,
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "feature-hash-v1".into()),
            embedding_dimension: parse_or("EMBEDDING_DIMENSION", 384)?,
            embedding_timeout_secs: parse_or("EMBEDDING_TIMEOUT_SECS", 10)?,
            llm_provider,
            llm_model: load_env_optional("LLM_MODEL").unwrap_or_else(|| "llama3.1".into()),
            theme_model: load_env_optional("THEME_MODEL"),
            ollama_url: load_env_optional("OLLAMA_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.into()),
            openai_base_url: load_env_optional("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.into()),
            openai_api_key,
            llm_timeout_secs: parse_or("LLM_TIMEOUT_SECS", 60)?,
            llm_max_tokens: parse_or("LLM_MAX_TOKENS", 400)?,
            theme_max_tokens: parse_or("THEME_MAX_TOKENS", 600)?,
            llm_retry_attempts: parse_or("LLM_RETRY_ATTEMPTS", 2)?,
            llm_retry_base_delay_ms: parse_or("LLM_RETRY_BASE_DELAY_MS", 500)?,
            synthesis_concurrency: parse_or("SYNTHESIS_CONCURRENCY", 4)?,
            ingest_concurrency: parse_or("INGEST_CONCURRENCY", 4)?,
            prompt_token_budget: parse_or("PROMPT_TOKEN_BUDGET", 3000)?,
            chunk_min_words: parse_or("CHUNK_MIN_WORDS", 2)?,
            chunk_max_chars: parse_or("CHUNK_MAX_CHARS", 1000)?,
            search_default_limit: parse_or("SEARCH_DEFAULT_LIMIT", 10)?,
            search_max_limit: parse_or("SEARCH_MAX_LIMIT", 50)?,
            search_default_min_score: parse_or("SEARCH_DEFAULT_MIN_SCORE", 0.2)?,
            index_snapshot_path: load_env_optional("INDEX_SNAPSHOT_PATH").map(PathBuf::from),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if self.embedding_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_TIMEOUT_SECS".into()));
        }
        if self.chunk_max_chars == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_MAX_CHARS".into()));
        }
        if self.synthesis_concurrency == 0 {
            return Err(ConfigError::InvalidValue("SYNTHESIS_CONCURRENCY".into()));
        }
        if self.ingest_concurrency == 0 {
            return Err(ConfigError::InvalidValue("INGEST_CONCURRENCY".into()));
        }
        if self.llm_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue("LLM_RETRY_ATTEMPTS".into()));
        }
        if self.search_max_limit == 0 {
            return Err(ConfigError::InvalidValue("SEARCH_MAX_LIMIT".into()));
        }
        if !(-1.0..=1.0).contains(&self.search_default_min_score) {
            return Err(ConfigError::InvalidValue("SEARCH_DEFAULT_MIN_SCORE".into()));
        }
        Ok(())
    }

    /// Chunk boundary thresholds derived from configuration.
    pub fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            min_words: self.chunk_min_words,
            max_chars: self.chunk_max_chars,
        }
    }

    /// Retry schedule applied to every language-model call.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.llm_retry_attempts,
            base_delay: Duration::from_millis(self.llm_retry_base_delay_ms),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Settings shared by the answer and theme stages.
    pub fn synthesis_settings(&self) -> SynthesisSettings {
        SynthesisSettings {
            retry: self.retry_policy(),
            call_timeout: Duration::from_secs(self.llm_timeout_secs),
            max_tokens: self.llm_max_tokens,
            theme_max_tokens: self.theme_max_tokens,
            prompt_token_budget: self.prompt_token_budget,
            concurrency: self.synthesis_concurrency,
        }
    }

    /// Settings for the orchestration service.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunk_policy: self.chunk_policy(),
            synthesis: self.synthesis_settings(),
            ingest_concurrency: self.ingest_concurrency,
            default_limit: self.search_default_limit,
            max_limit: self.search_max_limit,
            default_min_score: self.search_default_min_score,
            snapshot_path: self.index_snapshot_path.clone(),
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_required<T: FromStr>(key: &str) -> Result<T, ConfigError> {
    load_env_optional(key)
        .ok_or_else(|| ConfigError::MissingVariable(key.to_string()))?
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hashing" | "hash" => Ok(Self::Hashing),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        embedding_provider = ?config.embedding_provider,
        embedding_model = %config.embedding_model,
        llm_provider = ?config.llm_provider,
        llm_model = %config.llm_model,
        snapshot = ?config.index_snapshot_path,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
