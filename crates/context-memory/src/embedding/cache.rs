//! Process-wide embedding cache keyed by content hash.
//!
//! Shared, read-mostly. Writes are idempotent (recomputing and overwriting
//! with an identical vector is harmless), so inserts take no exclusive lock
//! beyond the shard the key lands in. Initialized at startup with the active
//! model id; invalidated wholesale when the model version changes.

use crate::embedding::provider::EmbeddingProvider;
use crate::error::MemoryError;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct EmbeddingCache {
    entries: DashMap<String, Arc<Vec<f32>>>,
    model_id: std::sync::RwLock<String>,
}

impl EmbeddingCache {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            model_id: std::sync::RwLock::new(model_id.into()),
        }
    }

    fn content_key(&self, text: &str) -> String {
        let model = self.model_id.read().expect("model id lock poisoned");
        let mut hasher = blake3::Hasher::new();
        hasher.update(model.as_bytes());
        hasher.update(b"\0");
        hasher.update(text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached vector and switch to a new model version. Existing
    /// keys become unreachable anyway since the model id is part of the key.
    pub fn invalidate_model(&self, new_model_id: impl Into<String>) {
        let new_model_id = new_model_id.into();
        {
            let mut model = self.model_id.write().expect("model id lock poisoned");
            *model = new_model_id.clone();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!("Embedding cache invalidated ({dropped} entries) for model '{new_model_id}'");
    }

    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.entries.get(&self.content_key(text)).map(|v| v.clone())
    }

    /// Look up `text`, computing and caching through `provider` on a miss.
    pub async fn get_or_compute(
        &self,
        provider: &dyn EmbeddingProvider,
        text: &str,
    ) -> Result<Arc<Vec<f32>>, MemoryError> {
        let key = self.content_key(text);
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }
        let vector = Arc::new(provider.embed(text).await?);
        debug!("Embedding cache miss ({} cached)", self.entries.len());
        self.entries.insert(key, vector.clone());
        Ok(vector)
    }

    /// Batch variant: resolves cached texts locally and computes the rest in
    /// one provider round trip, preserving input order.
    pub async fn get_or_compute_batch(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Arc<Vec<f32>>>, MemoryError> {
        let mut resolved: Vec<Option<Arc<Vec<f32>>>> = Vec::with_capacity(texts.len());
        let mut missing_texts = Vec::new();
        let mut missing_slots = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            match self.entries.get(&self.content_key(text)) {
                Some(hit) => resolved.push(Some(hit.clone())),
                None => {
                    resolved.push(None);
                    missing_texts.push(text.clone());
                    missing_slots.push(idx);
                }
            }
        }

        if !missing_texts.is_empty() {
            let computed = provider.embed_batch(&missing_texts).await?;
            for (slot, vector) in missing_slots.into_iter().zip(computed) {
                let vector = Arc::new(vector);
                self.entries.insert(self.content_key(&texts[slot]), vector.clone());
                resolved[slot] = Some(vector);
            }
        }

        Ok(resolved.into_iter().map(|v| v.expect("slot resolved")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::HashedEmbeddingProvider;

    #[tokio::test]
    async fn test_cache_hit_returns_same_vector() {
        let cache = EmbeddingCache::new("hashed-bow-32");
        let provider = HashedEmbeddingProvider::new(32);

        let first = cache.get_or_compute(&provider, "hello world").await.unwrap();
        let second = cache.get_or_compute(&provider, "hello world").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_model_invalidation_clears_entries() {
        let cache = EmbeddingCache::new("model-v1");
        let provider = HashedEmbeddingProvider::new(16);
        cache.get_or_compute(&provider, "alpha").await.unwrap();
        assert_eq!(cache.len(), 1);

        cache.invalidate_model("model-v2");
        assert!(cache.is_empty());
        assert!(cache.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_caches() {
        let cache = EmbeddingCache::new("hashed-bow-16");
        let provider = HashedEmbeddingProvider::new(16);
        cache.get_or_compute(&provider, "two").await.unwrap();

        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let batch = cache.get_or_compute_batch(&provider, &texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(cache.len(), 3);

        let direct = provider.embed("three").await.unwrap();
        assert_eq!(*batch[2], direct);
    }
}
