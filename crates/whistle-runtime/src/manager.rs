//! Conversation manager: the per-conversation state machine in motion.
//!
//! Every mutating operation follows the same discipline:
//! 1. lock the conversation (`Busy` if another operation holds it)
//! 2. build a [`Draft`]: a clone with the new changes applied
//! 3. write the changes to the audit store in one batch
//! 4. swap the draft in
//!
//! Step 2 runs under the caller's deadline, if any. An error, timeout or
//! dropped future during step 2 leaves the live conversation exactly as it
//! was. Steps 3 and 4 run on their own task and always finish together.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use whistle_core::{
    Change, ConsentGate, Conversation, ConversationId, EvidenceKind, ExtractionStatus,
    JudgmentResult, Phase, ReadinessPolicy, RetrievalResult, Turn,
};

use crate::audit::AuditStore;
use crate::config::RuntimeConfig;
use crate::ingest::EvidenceIngestor;
use crate::judge::{complete_within, JudgmentEngine};
use crate::prompts;
use crate::providers::LlmProvider;
use crate::registry::{ConversationGuard, ConversationRegistry};
use crate::retriever::{RetrieveError, Retriever};
use crate::usage::UsageTracker;
use crate::ServiceError;

/// Reply to `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub conversation_id: ConversationId,
    pub greeting_text: String,
}

/// Reply to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    /// Counsellor reply; empty for the affirmative pass-through
    pub reply_text: String,

    /// The conversation is awaiting (or has just given) confirmation
    pub ready_for_judgment: bool,

    /// The reporter accepted the offer: the caller should request a judgment
    pub awaiting_judgment_request: bool,
}

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: ExtractionStatus,
    pub kind: EvidenceKind,

    /// Why extraction was partial or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A conversation clone plus the changes that produced it.
struct Draft {
    conversation: Conversation,
    changes: Vec<Change>,
}

impl Draft {
    fn of(conversation: &Conversation) -> Self {
        Self {
            conversation: conversation.clone(),
            changes: Vec::new(),
        }
    }

    fn push(&mut self, change: Change) -> Result<(), ServiceError> {
        self.conversation.apply_one(&change)?;
        self.changes.push(change);
        Ok(())
    }
}

/// Run `work` under an optional caller deadline.
async fn within<T, F>(deadline: Option<Duration>, work: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
            warn!(timeout = ?limit, "Caller deadline exceeded");
            ServiceError::UpstreamTimeout
        })?,
        None => work.await,
    }
}

/// Owns the lifecycle of every conversation.
pub struct ConversationManager {
    registry: Arc<ConversationRegistry>,
    audit: Arc<dyn AuditStore>,
    retriever: Arc<Retriever>,
    provider: Arc<dyn LlmProvider>,
    consent: Arc<dyn ConsentGate>,
    ingestor: EvidenceIngestor,
    engine: JudgmentEngine,
    readiness: ReadinessPolicy,
    config: Arc<RuntimeConfig>,
    usage: Arc<UsageTracker>,
}

impl ConversationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RuntimeConfig>,
        audit: Arc<dyn AuditStore>,
        retriever: Arc<Retriever>,
        provider: Arc<dyn LlmProvider>,
        consent: Arc<dyn ConsentGate>,
        ingestor: EvidenceIngestor,
        usage: Arc<UsageTracker>,
    ) -> Self {
        let engine = JudgmentEngine::new(
            Arc::clone(&retriever),
            Arc::clone(&provider),
            Arc::clone(&config),
            Arc::clone(&usage),
        );
        Self {
            registry: Arc::new(ConversationRegistry::new(config.conversation.ttl)),
            readiness: config.readiness.clone(),
            audit,
            retriever,
            provider,
            consent,
            ingestor,
            engine,
            config,
            usage,
        }
    }

    /// Audit the draft, then swap it in. The spawned task owns the guard,
    /// so a caller that stops waiting cannot split the two steps.
    async fn commit(&self, mut guard: ConversationGuard, draft: Draft) -> Result<(), ServiceError> {
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            if !draft.changes.is_empty() {
                audit
                    .commit(draft.conversation.id(), &draft.changes)
                    .await?;
            }
            *guard = draft.conversation;
            Ok::<(), ServiceError>(())
        })
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
    }

    /// Open a conversation in GATHERING with the greeting as its first turn.
    pub async fn start(&self) -> Result<StartResponse, ServiceError> {
        self.registry.purge_expired();

        let conversation = Conversation::new(ConversationId::generate());
        let mut draft = Draft::of(&conversation);
        draft.push(Change::Turn(Turn::system(prompts::GREETING)))?;
        let id = draft.conversation.id().clone();

        let audit = Arc::clone(&self.audit);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            audit
                .commit(draft.conversation.id(), &draft.changes)
                .await?;
            registry.insert(draft.conversation);
            Ok::<(), ServiceError>(())
        })
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))??;

        info!(conversation_id = %id, "Conversation started");
        Ok(StartResponse {
            conversation_id: id,
            greeting_text: prompts::GREETING.to_string(),
        })
    }

    /// Handle one user message.
    pub async fn advance(
        &self,
        id: &ConversationId,
        text: &str,
        deadline: Option<Duration>,
    ) -> Result<SendMessageResponse, ServiceError> {
        let started = Instant::now();
        let guard = self.registry.acquire(id)?;
        let (draft, response) = within(deadline, self.reply(&guard, text)).await?;

        let phase = draft.conversation.phase();
        self.commit(guard, draft).await?;
        info!(
            conversation_id = %id,
            phase = %phase,
            ready = response.ready_for_judgment,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Message handled"
        );
        Ok(response)
    }

    /// Everything `advance` decides before anything is written.
    async fn reply(
        &self,
        conversation: &Conversation,
        text: &str,
    ) -> Result<(Draft, SendMessageResponse), ServiceError> {
        let id = conversation.id();
        let mut draft = Draft::of(conversation);
        draft.push(Change::Turn(Turn::user(text)))?;

        if conversation.phase() == Phase::AwaitingConfirmation {
            if self.consent.is_affirmative(text) {
                info!(conversation_id = %id, "Judgment offer accepted");
                return Ok((
                    draft,
                    SendMessageResponse {
                        reply_text: String::new(),
                        ready_for_judgment: true,
                        awaiting_judgment_request: true,
                    },
                ));
            }
            debug!(conversation_id = %id, "Judgment offer declined");
            let back = draft.conversation.phase_change(Phase::Gathering);
            draft.push(back)?;
        }

        let policies = self.grounding(id, text).await?;
        let messages = prompts::reply_messages(
            &draft.conversation,
            &policies,
            self.config.reasoning.history_window,
            &self.config.evidence,
        );
        let response = complete_within(
            self.provider.as_ref(),
            messages,
            &self.config.completion_config(),
            self.config.reasoning.timeout,
            &self.usage,
        )
        .await?;
        let mut reply_text = response.content.trim().to_string();
        draft.push(Change::Turn(Turn::system(reply_text.clone())))?;

        let readiness = self.readiness.evaluate(&draft.conversation);
        if readiness.ready {
            let offer = draft.conversation.phase_change(Phase::AwaitingConfirmation);
            draft.push(offer)?;
            draft.push(Change::Turn(Turn::system(prompts::CONFIRMATION_PROMPT)))?;
            reply_text.push_str("\n\n");
            reply_text.push_str(prompts::CONFIRMATION_PROMPT);
        }
        debug!(
            conversation_id = %id,
            k = policies.len(),
            reason = ?readiness.reason,
            "Reply drafted"
        );

        Ok((
            draft,
            SendMessageResponse {
                reply_text,
                ready_for_judgment: readiness.ready,
                awaiting_judgment_request: false,
            },
        ))
    }

    /// Policy passages for a reply. A missing index or a timeout surfaces;
    /// other embedding failures degrade to an ungrounded reply.
    async fn grounding(
        &self,
        id: &ConversationId,
        text: &str,
    ) -> Result<Vec<RetrievalResult>, ServiceError> {
        let query = if self.config.evidence.mask_pii {
            whistle_core::mask_pii(text)
        } else {
            text.to_string()
        };
        match self
            .retriever
            .search(&query, self.config.retrieval.reply_k)
            .await
        {
            Ok(hits) => Ok(hits),
            Err(RetrieveError::Embedding(e)) => {
                warn!(conversation_id = %id, error = %e, "Retrieval failed, replying without policy context");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attach an uploaded file. Extraction problems are recorded on the
    /// item, never raised.
    pub async fn ingest(
        &self,
        id: &ConversationId,
        filename: &str,
        bytes: &[u8],
        deadline: Option<Duration>,
    ) -> Result<UploadResponse, ServiceError> {
        let guard = self.registry.acquire(id)?;
        let item = within(deadline, async {
            Ok(self.ingestor.ingest(filename, bytes).await)
        })
        .await?;
        let response = UploadResponse {
            status: item.status,
            kind: item.kind,
            detail: item.failure_reason.clone(),
        };

        let mut draft = Draft::of(&guard);
        draft.push(Change::Evidence(item))?;
        self.commit(guard, draft).await?;
        info!(
            conversation_id = %id,
            status = %response.status,
            kind = ?response.kind,
            bytes = bytes.len(),
            "Evidence recorded"
        );
        Ok(response)
    }

    /// Produce and record a judgment.
    pub async fn judge(
        &self,
        id: &ConversationId,
        deadline: Option<Duration>,
    ) -> Result<JudgmentResult, ServiceError> {
        let guard = self.registry.acquire(id)?;
        let result = within(deadline, self.engine.judge(&guard)).await?;

        let mut draft = Draft::of(&guard);
        draft.push(Change::Judgment(result.clone()))?;
        self.commit(guard, draft).await?;
        Ok(result)
    }

    /// Discard all turns and evidence. Clearing an empty conversation is a
    /// no-op apart from the audit record.
    pub async fn clear(&self, id: &ConversationId) -> Result<(), ServiceError> {
        let guard = self.registry.acquire(id)?;
        let mut draft = Draft::of(&guard);
        draft.push(Change::Cleared)?;
        self.commit(guard, draft).await?;
        info!(conversation_id = %id, "Conversation cleared");
        Ok(())
    }

    /// Copy of the conversation's current state.
    pub fn snapshot(&self, id: &ConversationId) -> Result<Conversation, ServiceError> {
        let guard = self.registry.acquire(id)?;
        Ok(Conversation::clone(&guard))
    }

    pub fn purge_expired(&self) -> usize {
        self.registry.purge_expired()
    }

    pub fn active_conversations(&self) -> usize {
        self.registry.len()
    }
}
