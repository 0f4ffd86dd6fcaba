//! Text embedding backends.
//!
//! [`Embedder`] is the seam between retrieval and whatever model produces
//! vectors. Two implementations ship with the crate:
//!
//! - [`OllamaEmbedder`] calls a local Ollama server's `/api/embed`
//!   endpoint (e.g. `all-minilm`, 384 dimensions).
//! - [`HashingEmbedder`] is a deterministic bag-of-words feature hasher that
//!   needs no model at all. Useful offline and in tests.
//!
//! Backends never substitute a zero vector for a failed call: an
//! unreachable server is reported as [`ChatError::ModelUnavailable`].

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Numeric vector representation of a piece of text.
pub type EmbeddingVector = Vec<f32>;

/// Maps text to fixed-length vectors.
///
/// Implementations must be deterministic for a fixed model and return
/// vectors positionally aligned with their input.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, for logs and index metadata.
    fn model_name(&self) -> &str;

    /// Embed a batch of texts. The output has one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<EmbeddingVector> {
        let mut vectors = self.embed_batch(&[text.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ChatError::ModelUnavailable("embedder returned no vector".into()))
    }
}

/// Build the embedder selected by `config`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend {
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dims))),
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Embedder backed by Ollama's `/api/embed` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    /// Create an embedder for the server and model named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::InvalidConfiguration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ChatError::ModelUnavailable(format!(
                    "embedding server unreachable at {} (is Ollama running?): {e}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ChatError::ModelUnavailable(format!(
                "embedding request for {} failed with {status}: {body_text}",
                self.model
            )));
        }

        let EmbedResponse { embeddings: vectors } = response
            .json()
            .await
            .map_err(|e| ChatError::ModelUnavailable(format!("invalid embedding response: {e}")))?;
        if vectors.iter().any(Vec::is_empty) {
            return Err(ChatError::ModelUnavailable(
                "embedding response contains an empty vector".into(),
            ));
        }

        if vectors.len() != texts.len() {
            return Err(ChatError::ModelUnavailable(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        debug!(count = vectors.len(), model = %self.model, "embedded batch");
        Ok(vectors)
    }
}

/// Body of a successful `/api/embed` response.
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<EmbeddingVector>,
}

// ---------------------------------------------------------------------------
// Feature hashing
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased alphanumeric word is hashed (FNV-1a) into one of `dims`
/// buckets with a hash-derived sign, then the vector is L2-normalized.
/// Texts sharing vocabulary land close together under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    name: String,
}

impl HashingEmbedder {
    /// Create a hashing embedder producing `dims`-dimensional vectors.
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            name: format!("hashing-{dims}"),
        }
    }

    /// Output dimension.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed synchronously.
    pub fn embed_sync(&self, text: &str) -> EmbeddingVector {
        let mut vector = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let h = fnv1a(word.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Vector math
// ---------------------------------------------------------------------------

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1, 1]`; `0.0` when either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}
