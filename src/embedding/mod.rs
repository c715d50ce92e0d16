//! Embedding collaborators and the identity of the vector space they produce.
//!
//! Every client reports an [`EmbeddingSpace`]; the index records the space it was populated
//! under and refuses vectors from any other one.

mod ollama;

pub use ollama::OllamaEmbeddingClient;

use crate::config::{Config, EmbeddingProvider};
use crate::processing::mappers::compute_content_hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider response could not be parsed.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
}

/// Identity of an embedding function: provider, model and output dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    /// Provider family, e.g. `hashing` or `ollama`.
    pub provider: String,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Length of every produced vector.
    pub dimension: usize,
}

impl EmbeddingSpace {
    /// Describe an embedding space.
    pub fn new(provider: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            dimension,
        }
    }

    /// Stable SHA-256 digest of the identity, recorded in snapshots.
    pub fn fingerprint(&self) -> String {
        compute_content_hash(&format!(
            "{}\n{}\n{}",
            self.provider, self.model, self.dimension
        ))
    }
}

impl fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.provider, self.model, self.dimension)
    }
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Identity of the vectors this client produces.
    fn space(&self) -> &EmbeddingSpace;

    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Deterministic offline embedding client based on signed feature hashing.
///
/// Lower-cased alphanumeric tokens are hashed (FNV-1a) into `dimension` buckets with a sign
/// bit, then the vector is L2-normalised. Texts sharing no tokens score near zero, identical
/// texts score exactly one.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingClient {
    space: EmbeddingSpace,
}

impl HashingEmbeddingClient {
    /// Provider name recorded in the embedding space.
    pub const PROVIDER: &'static str = "hashing";

    /// Construct a hashing client for the given model label and dimension.
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            space: EmbeddingSpace::new(Self::PROVIDER, model, dimension.max(1)),
        }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let dimension = self.space.dimension;
        let mut embedding = vec![0.0_f32; dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            let position = (hash % dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            embedding[position] += sign;
        }

        normalize(&mut embedding);
        embedding
    }
}

fn fnv1a(token: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    token.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

#[async_trait]
impl EmbeddingClient for HashingEmbeddingClient {
    fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tracing::debug!(
            model = %self.space.model,
            dimension = self.space.dimension,
            count = texts.len(),
            "Generating embeddings"
        );
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

/// Build an embedding client suitable for the supplied configuration.
pub fn build_embedding_client(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    match config.embedding_provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbeddingClient::new(
            config.embedding_model.clone(),
            config.embedding_dimension,
        ))),
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbeddingClient::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
            config.embedding_dimension,
            Duration::from_secs(config.embedding_timeout_secs),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(a, b)| a * b).sum()
    }

    #[tokio::test]
    async fn hashing_client_is_deterministic_and_normalised() {
        let client = HashingEmbeddingClient::new("test", 64);
        let first = client
            .generate_embeddings(vec!["Tax policy changed".into()])
            .await
            .unwrap();
        let second = client
            .generate_embeddings(vec!["tax POLICY changed!".into()])
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].len(), 64);
        assert!((cosine(&first[0], &first[0]) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn empty_text_yields_zero_vector() {
        let client = HashingEmbeddingClient::new("test", 8);
        let vectors = client.generate_embeddings(vec!["  ".into()]).await.unwrap();
        assert!(vectors[0].iter().all(|value| *value == 0.0));
    }

    #[test]
    fn space_fingerprint_tracks_identity() {
        let a = EmbeddingSpace::new("hashing", "v1", 384);
        let b = EmbeddingSpace::new("hashing", "v1", 256);
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.to_string(), "hashing/v1@384");
    }

    #[test]
    fn normalize_leaves_zero_vectors_alone() {
        let mut zero = vec![0.0_f32; 3];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);

        let mut vector = vec![3.0_f32, 4.0];
        normalize(&mut vector);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);
    }
}
