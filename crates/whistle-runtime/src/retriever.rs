//! Policy retrieval: embed the query, rank against the loaded index.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};
use whistle_core::{IndexError, PolicyIndex, RetrievalResult};

use crate::cache::{EmbeddingCache, EmbeddingKey};
use crate::providers::{EmbeddingProvider, ProviderError};

/// Errors from a search.
#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("no policy index is loaded")]
    IndexUnavailable,

    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

/// Swappable handle to the current index.
///
/// Readers take an `Arc` snapshot, so a rebuild installed mid-search never
/// changes the index that search is ranking against.
#[derive(Debug, Default)]
pub struct PolicyIndexHandle {
    current: RwLock<Option<Arc<PolicyIndex>>>,
}

impl PolicyIndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: PolicyIndex) -> Self {
        let handle = Self::new();
        handle.install(index);
        handle
    }

    /// Replace the current index wholesale. Returns the previous one.
    pub fn install(&self, index: PolicyIndex) -> Option<Arc<PolicyIndex>> {
        info!(
            entries = index.len(),
            dimension = index.dimension(),
            fingerprint = index.fingerprint(),
            "Installing policy index"
        );
        self.current.write().replace(Arc::new(index))
    }

    pub fn unload(&self) -> Option<Arc<PolicyIndex>> {
        self.current.write().take()
    }

    pub fn snapshot(&self) -> Option<Arc<PolicyIndex>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}

/// Embeds queries and ranks them against the current index.
pub struct Retriever {
    index: Arc<PolicyIndexHandle>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        index: Arc<PolicyIndexHandle>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: EmbeddingCache,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            cache,
            timeout,
        }
    }

    pub fn index(&self) -> &Arc<PolicyIndexHandle> {
        &self.index
    }

    /// Search with the configured embedding timeout.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrieveError> {
        self.search_with_timeout(query, k, self.timeout).await
    }

    /// Top `k` policy passages for `query`.
    ///
    /// Fails with [`RetrieveError::IndexUnavailable`] when nothing is
    /// loaded; an empty loaded index yields an empty result.
    pub async fn search_with_timeout(
        &self,
        query: &str,
        k: usize,
        timeout: Duration,
    ) -> Result<Vec<RetrievalResult>, RetrieveError> {
        let index = self.index.snapshot().ok_or(RetrieveError::IndexUnavailable)?;
        if index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embed_query(query, timeout).await?;
        let results = index.rank(&vector, k)?;

        debug!(
            k,
            hits = results.len(),
            top_score = results.first().map(|r| r.score).unwrap_or(0.0),
            fingerprint = index.fingerprint(),
            "Policy search complete"
        );
        Ok(results)
    }

    async fn embed_query(&self, query: &str, timeout: Duration) -> Result<Arc<Vec<f32>>, RetrieveError> {
        let key = EmbeddingKey::new(self.embedder.name(), query);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let vector = tokio::time::timeout(timeout, self.embedder.embed(query))
            .await
            .map_err(|_| RetrieveError::Timeout(timeout))?
            .map_err(|e| match e {
                ProviderError::Timeout(d) => RetrieveError::Timeout(d),
                other => RetrieveError::Embedding(other),
            })?;
        Ok(self.cache.insert(key, vector).await)
    }
}
