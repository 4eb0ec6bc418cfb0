//! `WhistleService`: the request/response surface of the intake core.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use whistle_core::{
    ConsentGate, Conversation, ConversationId, JudgmentResult, PolicyIndex, RetrievalResult,
    TokenConsent,
};

use crate::audit::{AuditRecord, AuditStore, MemoryAuditStore};
use crate::cache::EmbeddingCache;
use crate::config::{ConfigError, RuntimeConfig};
use crate::ingest::{EvidenceIngestor, OcrEngine};
use crate::manager::{ConversationManager, SendMessageResponse, StartResponse, UploadResponse};
use crate::providers::{
    EmbeddingProvider, HashingEmbedder, LlmProvider, DEFAULT_HASHING_DIMENSION,
};
use crate::retriever::{PolicyIndexHandle, Retriever};
use crate::usage::{LlmUsage, UsageTracker};
use crate::ServiceError;

/// Errors assembling a service.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("embedder produces {embedder}-dimensional vectors but the index holds {index}")]
    DimensionMismatch { embedder: usize, index: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The intake service.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Operations on
/// different conversations run concurrently, operations on the same
/// conversation are refused with [`ServiceError::Busy`] while one is in
/// flight.
///
/// The `*_within` variants take a caller deadline covering retrieval,
/// extraction and reasoning. Missing it fails with
/// [`ServiceError::UpstreamTimeout`] and records nothing. Once the audit
/// write has begun the operation completes even if the caller stops
/// waiting.
pub struct WhistleService {
    manager: ConversationManager,
    retriever: Arc<Retriever>,
    audit: Arc<dyn AuditStore>,
    usage: Arc<UsageTracker>,
    config: Arc<RuntimeConfig>,
}

impl WhistleService {
    pub fn builder() -> WhistleServiceBuilder {
        WhistleServiceBuilder::new()
    }

    pub async fn start_conversation(&self) -> Result<StartResponse, ServiceError> {
        self.manager.start().await
    }

    pub async fn send_message(
        &self,
        id: &ConversationId,
        text: &str,
    ) -> Result<SendMessageResponse, ServiceError> {
        self.manager.advance(id, text, None).await
    }

    pub async fn send_message_within(
        &self,
        id: &ConversationId,
        text: &str,
        deadline: Duration,
    ) -> Result<SendMessageResponse, ServiceError> {
        self.manager.advance(id, text, Some(deadline)).await
    }

    pub async fn upload_evidence(
        &self,
        id: &ConversationId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<UploadResponse, ServiceError> {
        self.manager.ingest(id, filename, bytes, None).await
    }

    pub async fn upload_evidence_within(
        &self,
        id: &ConversationId,
        filename: &str,
        bytes: &[u8],
        deadline: Duration,
    ) -> Result<UploadResponse, ServiceError> {
        self.manager.ingest(id, filename, bytes, Some(deadline)).await
    }

    pub async fn request_judgment(
        &self,
        id: &ConversationId,
    ) -> Result<JudgmentResult, ServiceError> {
        self.manager.judge(id, None).await
    }

    pub async fn request_judgment_within(
        &self,
        id: &ConversationId,
        deadline: Duration,
    ) -> Result<JudgmentResult, ServiceError> {
        self.manager.judge(id, Some(deadline)).await
    }

    pub async fn clear_conversation(&self, id: &ConversationId) -> Result<(), ServiceError> {
        self.manager.clear(id).await
    }

    /// Direct policy search, outside any conversation.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, ServiceError> {
        Ok(self.retriever.search(query, k).await?)
    }

    /// Publish a new policy index. In-flight searches finish on the old one.
    pub fn install_index(&self, index: PolicyIndex) -> Option<Arc<PolicyIndex>> {
        self.retriever.index().install(index)
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    /// Current state of a conversation.
    pub fn conversation(&self, id: &ConversationId) -> Result<Conversation, ServiceError> {
        self.manager.snapshot(id)
    }

    /// Everything ever recorded for a conversation, including cleared content.
    pub async fn audit_history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, ServiceError> {
        Ok(self.audit.history(id).await?)
    }

    pub fn usage(&self) -> LlmUsage {
        self.usage.snapshot()
    }

    pub fn purge_expired(&self) -> usize {
        self.manager.purge_expired()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Builder for [`WhistleService`].
///
/// Only the reasoning provider is required. Defaults: the offline hashing
/// embedder, an in-memory audit store, the built-in consent tokens, no OCR
/// and no index (searches fail with `IndexUnavailable` until one is
/// installed).
pub struct WhistleServiceBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    audit: Option<Arc<dyn AuditStore>>,
    consent: Option<Arc<dyn ConsentGate>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    index: Option<PolicyIndex>,
    config: RuntimeConfig,
}

impl WhistleServiceBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            embedder: None,
            audit: None,
            consent: None,
            ocr: None,
            index: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn consent(mut self, consent: Arc<dyn ConsentGate>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    pub fn index(mut self, index: PolicyIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WhistleService, BuildError> {
        let provider = self
            .provider
            .ok_or(BuildError::NotConfigured("reasoning provider"))?;
        self.config.validate()?;
        let config = Arc::new(self.config);

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashingEmbedder::new(DEFAULT_HASHING_DIMENSION)));

        let handle = Arc::new(PolicyIndexHandle::new());
        if let Some(index) = self.index {
            if !index.is_empty() && index.dimension() != embedder.dimension() {
                return Err(BuildError::DimensionMismatch {
                    embedder: embedder.dimension(),
                    index: index.dimension(),
                });
            }
            handle.install(index);
        }

        let cache = EmbeddingCache::new(config.cache.max_entries, config.cache.ttl);
        let retriever = Arc::new(Retriever::new(
            handle,
            Arc::clone(&embedder),
            cache,
            config.retrieval.embedding_timeout,
        ));

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(MemoryAuditStore::new()));
        let consent = self
            .consent
            .unwrap_or_else(|| Arc::new(TokenConsent::default()));

        let mut ingestor =
            EvidenceIngestor::new(config.evidence.max_bytes, config.evidence.ocr_timeout);
        if let Some(ocr) = self.ocr {
            ingestor = ingestor.with_ocr(ocr);
        }

        let usage = Arc::new(UsageTracker::new());
        let manager = ConversationManager::new(
            Arc::clone(&config),
            Arc::clone(&audit),
            Arc::clone(&retriever),
            Arc::clone(&provider),
            consent,
            ingestor,
            Arc::clone(&usage),
        );

        info!(
            provider = provider.name(),
            embedder = embedder.name(),
            index_loaded = retriever.index().is_loaded(),
            "Whistle service ready"
        );

        Ok(WhistleService {
            manager,
            retriever,
            audit,
            usage,
            config,
        })
    }
}

impl Default for WhistleServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
