//! Judgment engine: ground, ask, validate.
//!
//! The engine never mutates a conversation. It reads a snapshot and returns
//! either a validated [`JudgmentResult`] or an error; recording the result
//! is the caller's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use whistle_core::{
    parse_judgment, readiness::window_categories, Conversation, JudgmentResult, Phase,
};

use crate::config::RuntimeConfig;
use crate::prompts;
use crate::providers::{ChatMessage, CompletionConfig, CompletionResponse, LlmProvider};
use crate::retriever::Retriever;
use crate::usage::UsageTracker;
use crate::ServiceError;

/// Run one completion under a deadline and account for its usage.
pub(crate) async fn complete_within(
    provider: &dyn LlmProvider,
    messages: Vec<ChatMessage>,
    config: &CompletionConfig,
    deadline: Duration,
    usage: &UsageTracker,
) -> Result<CompletionResponse, ServiceError> {
    let response = tokio::time::timeout(deadline, provider.complete(messages, config))
        .await
        .map_err(|_| {
            warn!(provider = provider.name(), timeout = ?deadline, "Reasoning call timed out");
            ServiceError::UpstreamTimeout
        })??;
    usage.record(&response.usage, &response.model);
    Ok(response)
}

/// Produces structured judgments for conversations.
pub struct JudgmentEngine {
    retriever: Arc<Retriever>,
    provider: Arc<dyn LlmProvider>,
    config: Arc<RuntimeConfig>,
    usage: Arc<UsageTracker>,
}

impl JudgmentEngine {
    pub fn new(
        retriever: Arc<Retriever>,
        provider: Arc<dyn LlmProvider>,
        config: Arc<RuntimeConfig>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        Self {
            retriever,
            provider,
            config,
            usage,
        }
    }

    /// Judge the conversation as it stands.
    ///
    /// Fails with [`ServiceError::InsufficientContext`] when nothing has
    /// been said or uploaded since the last judgment, or when the
    /// conversation has not qualified for the judgment offer. Retrieval
    /// failures surface: a judgment is never produced without policy
    /// grounding.
    pub async fn judge(&self, conversation: &Conversation) -> Result<JudgmentResult, ServiceError> {
        if !conversation.has_judgeable_input() {
            return Err(ServiceError::InsufficientContext);
        }
        if conversation.phase() != Phase::AwaitingConfirmation {
            debug!(
                conversation_id = %conversation.id(),
                phase = %conversation.phase(),
                "Judgment requested before qualifying"
            );
            return Err(ServiceError::InsufficientContext);
        }
        let started = Instant::now();
        let evidence_config = &self.config.evidence;

        let query = prompts::synthesize_query(conversation, evidence_config.mask_pii);
        let policies = self
            .retriever
            .search(&query, self.config.retrieval.judgment_k)
            .await?;

        let categories = window_categories(conversation);
        let messages =
            prompts::judgment_messages(conversation, &policies, &categories, evidence_config);

        let response = complete_within(
            self.provider.as_ref(),
            messages,
            &self.config.completion_config(),
            self.config.reasoning.timeout,
            &self.usage,
        )
        .await?;

        let result = parse_judgment(&response.content, &policies).map_err(|e| {
            warn!(conversation_id = %conversation.id(), error = %e, "Rejected malformed judgment");
            ServiceError::MalformedJudgment(e.to_string())
        })?;

        info!(
            conversation_id = %conversation.id(),
            severity = result.severity.ordinal(),
            violations = result.violation_type.len(),
            citations = result.policy_links.len(),
            unverified = result.unverified_citations.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Judgment produced"
        );
        Ok(result)
    }
}
