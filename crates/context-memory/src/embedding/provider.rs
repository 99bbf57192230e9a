//! Embedding providers.
//!
//! `HttpEmbeddingProvider` proxies to an OpenAI-compatible `/v1/embeddings`
//! endpoint on a local backend. `HashedEmbeddingProvider` is a deterministic
//! bag-of-words projection used for tests and as an offline stand-in; it
//! captures lexical overlap, not deep semantics.

use crate::error::MemoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Maps free text to fixed-length dense vectors. Failure must degrade
/// gracefully (`EmbeddingUnavailable`), never produce silent zero vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Fixed output dimensionality. Identical for every vector produced.
    fn dimension(&self) -> usize;

    /// Identifier recorded with cached vectors; changing it invalidates them.
    fn model_id(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vecs = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vecs.pop().ok_or_else(|| {
            MemoryError::EmbeddingUnavailable("backend returned an empty batch".into())
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding provider backed by a local OpenAI-compatible HTTP endpoint.
pub struct HttpEmbeddingProvider {
    backend_url: String,
    model: String,
    dimension: usize,
    http_client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(backend_url: String, model: String, dimension: usize, timeout_seconds: u64) -> Self {
        info!("Embedding provider initialized with backend: {}", backend_url);
        Self {
            backend_url,
            model,
            dimension,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_default(),
        }
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Requesting {} embeddings from backend", texts.len());

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .http_client
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "backend returned HTTP {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;

        if parsed.data.len() != texts.len() {
            return Err(MemoryError::EmbeddingUnavailable(format!(
                "backend returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for item in parsed.data {
            if item.embedding.len() != self.dimension {
                return Err(MemoryError::DimensionMismatch {
                    expected: self.dimension,
                    actual: item.embedding.len(),
                });
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }
}

/// Deterministic hashed bag-of-words projection. Each lowercased token is
/// hashed into a bucket with a signed contribution; the result is
/// L2-normalized so cosine similarity reflects token overlap.
pub struct HashedEmbeddingProvider {
    dimension: usize,
    model: String,
}

impl HashedEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model: format!("hashed-bow-{dimension}"),
        }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket % self.dimension] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts.iter().map(|t| self.project(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_hashed_provider_is_deterministic() {
        let provider = HashedEmbeddingProvider::new(64);
        let a = provider.embed("the trip in March").await.unwrap();
        let b = provider.embed("the trip in March").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_lexical_overlap_raises_similarity() {
        let provider = HashedEmbeddingProvider::new(128);
        let trip_a = provider.embed("my trip to the mountains").await.unwrap();
        let trip_b = provider.embed("a trip to the coast").await.unwrap();
        let unrelated = provider.embed("quarterly revenue spreadsheet").await.unwrap();

        let related = cosine_similarity(&trip_a, &trip_b);
        let distant = cosine_similarity(&trip_a, &unrelated);
        assert!(related > distant, "related {related} <= distant {distant}");
    }

    #[tokio::test]
    async fn test_empty_text_yields_zero_vector() {
        let provider = HashedEmbeddingProvider::new(32);
        let v = provider.embed("").await.unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
