//! Query-embedding cache.
//!
//! Reporters often restate the same facts, and judgment queries are rebuilt
//! from the same turns; caching embeddings keeps repeated searches off the
//! embedding service.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Cache key: the embedder's name plus the exact query text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    provider: String,
    text: String,
}

impl EmbeddingKey {
    pub fn new(provider: &str, text: &str) -> Self {
        Self {
            provider: provider.to_string(),
            text: text.to_string(),
        }
    }
}

/// Bounded, time-limited embedding cache using moka.
#[derive(Clone)]
pub struct EmbeddingCache {
    cache: Cache<EmbeddingKey, Arc<Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &EmbeddingKey) -> Option<Arc<Vec<f32>>> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: EmbeddingKey, vector: Vec<f32>) -> Arc<Vec<f32>> {
        let vector = Arc::new(vector);
        self.cache.insert(key, Arc::clone(&vector)).await;
        vector
    }

    /// Drop everything, e.g. after the embedder changes.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let cache = EmbeddingCache::default();
        let key = EmbeddingKey::new("hashing-8", "funds moved");

        assert!(cache.get(&key).await.is_none());
        cache.insert(key.clone(), vec![1.0, 0.0]).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some(&vec![1.0, 0.0]));

        let other_provider = EmbeddingKey::new("hashing-16", "funds moved");
        assert!(cache.get(&other_provider).await.is_none());
    }
}
