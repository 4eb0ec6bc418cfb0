//! # whistle-runtime
//!
//! Async orchestration for the whistle-blower intake assistant.
//!
//! This crate wires the deterministic pieces of `whistle-core` to the
//! outside world:
//! - reasoning and embedding providers behind traits
//! - policy retrieval over an atomically swappable index
//! - evidence ingestion with optional OCR
//! - the conversation manager and judgment engine
//! - an append-only audit trail (in memory or SQLite)
//!
//! [`WhistleService`] is the entry point.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use whistle_runtime::{WhistleService, providers::AnthropicProvider};
//!
//! let service = WhistleService::builder()
//!     .provider(Arc::new(AnthropicProvider::from_config(&serde_json::json!({}))?))
//!     .index(PolicyIndex::load_jsonl("policies.jsonl")?)
//!     .build()?;
//!
//! let started = service.start_conversation().await?;
//! let reply = service
//!     .send_message(&started.conversation_id, "My manager moved client funds")
//!     .await?;
//! if reply.ready_for_judgment {
//!     let judgment = service.request_judgment(&started.conversation_id).await?;
//!     println!("{}", judgment.severity_label);
//! }
//! ```

use thiserror::Error;
use whistle_core::{ConversationId, TransitionError};

pub mod audit;
pub mod cache;
pub mod config;
pub mod index_builder;
pub mod ingest;
pub mod judge;
pub mod manager;
pub mod prompts;
pub mod providers;
pub mod registry;
pub mod retriever;
pub mod service;
pub mod usage;

pub use audit::{AuditError, AuditRecord, AuditStore, MemoryAuditStore, SqliteAuditStore};
pub use cache::{EmbeddingCache, EmbeddingKey};
pub use config::{ConfigError, RuntimeConfig};
pub use index_builder::{load_sources, IndexBuilder};
pub use ingest::{EvidenceIngestor, OcrEngine};
pub use judge::JudgmentEngine;
pub use manager::{ConversationManager, SendMessageResponse, StartResponse, UploadResponse};
pub use providers::{EmbeddingProvider, LlmProvider, ProviderError};
pub use registry::{ConversationRegistry, RegistryError};
pub use retriever::{PolicyIndexHandle, RetrieveError, Retriever};
pub use service::{BuildError, WhistleService, WhistleServiceBuilder};
pub use usage::{LlmUsage, UsageTracker};

/// Errors returned by service operations.
///
/// Extraction failures are not here: they are recorded on the evidence item
/// and reported in [`UploadResponse`].
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    #[error("conversation {0} is busy")]
    Busy(ConversationId),

    #[error("no policy index is loaded")]
    IndexUnavailable,

    #[error("more input needed before a judgment can be made")]
    InsufficientContext,

    #[error("malformed judgment: {0}")]
    MalformedJudgment(String),

    #[error("upstream call timed out")]
    UpstreamTimeout,

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("audit write failed: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ServiceError::NotFound(id),
            RegistryError::Busy(id) => ServiceError::Busy(id),
        }
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout(_) => ServiceError::UpstreamTimeout,
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

impl From<RetrieveError> for ServiceError {
    fn from(err: RetrieveError) -> Self {
        match err {
            RetrieveError::IndexUnavailable => ServiceError::IndexUnavailable,
            RetrieveError::Timeout(_) => ServiceError::UpstreamTimeout,
            RetrieveError::Embedding(e) => e.into(),
            RetrieveError::Index(e) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<AuditError> for ServiceError {
    fn from(err: AuditError) -> Self {
        ServiceError::Storage(err.to_string())
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}
