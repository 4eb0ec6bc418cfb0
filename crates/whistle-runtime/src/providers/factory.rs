//! Named provider construction from JSON configuration.
//!
//! The CLI and embedding applications pick reasoning and embedding
//! backends by name ("anthropic", "openai", "hashing"); factories turn a
//! name plus a JSON blob into a trait object.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::embedding::{EmbeddingProvider, HashingEmbedder, DEFAULT_HASHING_DIMENSION};
use super::{LlmProvider, ProviderError};

/// Builds chat-completion providers.
pub trait ReasoningFactory: Send + Sync {
    /// Registry key, e.g. "anthropic".
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    fn description(&self) -> &'static str {
        "Reasoning provider"
    }
}

/// Builds embedding providers.
pub trait EmbeddingFactory: Send + Sync {
    /// Registry key, e.g. "hashing".
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn EmbeddingProvider>, ProviderError>;

    fn description(&self) -> &'static str {
        "Embedding provider"
    }
}

/// Offline feature-hashing embedder. Config: `{"dimension": 384}`.
pub struct HashingEmbedderFactory;

impl EmbeddingFactory for HashingEmbedderFactory {
    fn provider_type(&self) -> &'static str {
        "hashing"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        let dimension = match config.get("dimension") {
            None | Some(JsonValue::Null) => DEFAULT_HASHING_DIMENSION,
            Some(value) => value
                .as_u64()
                .filter(|d| *d > 0)
                .ok_or_else(|| {
                    ProviderError::NotConfigured("dimension must be a positive integer".to_string())
                })? as usize,
        };
        Ok(Arc::new(HashingEmbedder::new(dimension)))
    }

    fn description(&self) -> &'static str {
        "Deterministic feature-hashing embedder (no network)"
    }
}

/// Factories keyed by provider name.
#[derive(Default)]
pub struct ProviderRegistry {
    reasoning: BTreeMap<String, Arc<dyn ReasoningFactory>>,
    embedding: BTreeMap<String, Arc<dyn EmbeddingFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reasoning factory, replacing any with the same name.
    pub fn register_reasoning(&mut self, factory: Arc<dyn ReasoningFactory>) {
        self.reasoning
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Register an embedding factory, replacing any with the same name.
    pub fn register_embedding(&mut self, factory: Arc<dyn EmbeddingFactory>) {
        self.embedding
            .insert(factory.provider_type().to_string(), factory);
    }

    pub fn reasoning(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.reasoning
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "Unknown reasoning provider '{}'. Available: {:?}",
                    provider_type,
                    self.reasoning_types()
                ))
            })?
            .create(config)
    }

    pub fn embedding(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        self.embedding
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "Unknown embedding provider '{}'. Available: {:?}",
                    provider_type,
                    self.embedding_types()
                ))
            })?
            .create(config)
    }

    pub fn reasoning_types(&self) -> Vec<&str> {
        self.reasoning.keys().map(|s| s.as_str()).collect()
    }

    pub fn embedding_types(&self) -> Vec<&str> {
        self.embedding.keys().map(|s| s.as_str()).collect()
    }

    /// Registry with every provider compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_embedding(Arc::new(HashingEmbedderFactory));
        #[cfg(feature = "anthropic")]
        registry.register_reasoning(Arc::new(super::AnthropicProviderFactory));
        #[cfg(feature = "openai")]
        registry.register_embedding(Arc::new(super::OpenAiEmbedderFactory));
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("reasoning", &self.reasoning_types())
            .field("embedding", &self.embedding_types())
            .finish()
    }
}
