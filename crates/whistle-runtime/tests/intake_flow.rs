//! End-to-end intake scenarios against scripted providers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use whistle_core::{
    Change, ConversationId, ExtractionStatus, Phase, PolicyEntry, PolicyIndex, Sender, Severity,
};
use whistle_runtime::audit::{AuditError, AuditRecord, AuditStore, MemoryAuditStore};
use whistle_runtime::prompts;
use whistle_runtime::providers::{
    ChatMessage, CompletionConfig, CompletionResponse, HashingEmbedder, LlmProvider,
    ProviderError, TokenUsage,
};
use whistle_runtime::{ServiceError, WhistleService};

const DIMENSION: usize = 256;
const REPORT: &str = "I saw my manager transfer funds without approval";

const VALID_JUDGMENT: &str = r#"Here is my assessment:
```json
{
  "violation_type": ["Embezzlement", "Breach of duty"],
  "severity": 2,
  "severity_label": "Serious",
  "recommended_actions": ["Refer to internal audit", "Freeze the affected accounts"],
  "rationale": "Funds were moved without the dual approval the code of conduct requires.",
  "citations": ["conduct-7", "ghost-99"],
  "confidence": 0.8,
  "needs_more_evidence": false
}
```"#;

const OUT_OF_RANGE_JUDGMENT: &str = r#"{
  "violation_type": ["Embezzlement"],
  "severity": 7,
  "recommended_actions": ["Escalate"],
  "rationale": "Very bad."
}"#;

/// Replies with a fixed counselling line; answers judgment requests with
/// whatever is currently scripted.
struct ScriptedProvider {
    judgment: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(judgment: &str) -> Arc<Self> {
        Arc::new(Self {
            judgment: Mutex::new(judgment.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn script_judgment(&self, judgment: &str) {
        *self.judgment.lock() = judgment.to_string();
    }
}

fn is_judgment_request(messages: &[ChatMessage]) -> bool {
    messages
        .first()
        .map(|m| m.content == prompts::JUDGE_SYSTEM_PROMPT.trim())
        .unwrap_or(false)
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = if is_judgment_request(&messages) {
            self.judgment.lock().clone()
        } else {
            "Thank you. When did this happen, and who else was involved?".to_string()
        };
        Ok(CompletionResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            },
            model: "scripted".to_string(),
            stop_reason: Some("end_turn".to_string()),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Never answers.
struct StalledProvider;

#[async_trait]
impl LlmProvider for StalledProvider {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ProviderError::HttpError("unreachable".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

/// Blocks inside `complete` until released.
struct GatedProvider {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl LlmProvider for GatedProvider {
    async fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(CompletionResponse {
            content: "Go on.".to_string(),
            usage: TokenUsage::default(),
            model: "gated".to_string(),
            stop_reason: None,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Audit store that can be switched to failing.
#[derive(Default)]
struct FlakyAudit {
    inner: MemoryAuditStore,
    failing: AtomicBool,
}

#[async_trait]
impl AuditStore for FlakyAudit {
    async fn commit(&self, id: &ConversationId, changes: &[Change]) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Task("disk full".to_string()));
        }
        self.inner.commit(id, changes).await
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.history(id).await
    }
}

/// Records each batch, then takes a while to acknowledge it.
struct SlowAudit {
    inner: MemoryAuditStore,
    delay: Duration,
}

#[async_trait]
impl AuditStore for SlowAudit {
    async fn commit(&self, id: &ConversationId, changes: &[Change]) -> Result<(), AuditError> {
        self.inner.commit(id, changes).await?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, AuditError> {
        self.inner.history(id).await
    }
}

fn policy_index() -> PolicyIndex {
    let embedder = HashingEmbedder::new(DIMENSION);
    let passages = [
        (
            "conduct-7",
            "Code of Conduct",
            "Article 7",
            "Employees must not transfer or misappropriate company funds without dual approval.",
        ),
        (
            "privacy-2",
            "Privacy Policy",
            "Section 2",
            "Customer personal information must never be disclosed outside the bank.",
        ),
        (
            "gifts-4",
            "Code of Conduct",
            "Article 4",
            "Staff may not accept kickbacks or gifts from vendors.",
        ),
    ];
    let entries = passages
        .iter()
        .map(|(id, title, section, text)| PolicyEntry {
            id: id.to_string(),
            title: title.to_string(),
            section: section.to_string(),
            text: text.to_string(),
            embedding: embedder.embed_sync(text),
            citation_url: format!("https://policies.example/{}", id),
        })
        .collect();
    PolicyIndex::new(entries).unwrap()
}

fn service_with(provider: Arc<dyn LlmProvider>, audit: Arc<dyn AuditStore>) -> WhistleService {
    WhistleService::builder()
        .provider(provider)
        .embedder(Arc::new(HashingEmbedder::new(DIMENSION)))
        .audit(audit)
        .index(policy_index())
        .build()
        .unwrap()
}

fn service(provider: Arc<dyn LlmProvider>) -> WhistleService {
    service_with(provider, Arc::new(MemoryAuditStore::new()))
}

/// Send the standard report until the service offers a judgment.
async fn qualify(service: &WhistleService, id: &ConversationId) -> usize {
    for sent in 1..=10 {
        let reply = service.send_message(id, REPORT).await.unwrap();
        if reply.ready_for_judgment {
            return sent;
        }
    }
    panic!("conversation never became ready");
}

#[tokio::test]
async fn test_start_greets_in_gathering() {
    let audit = Arc::new(MemoryAuditStore::new());
    let service = service_with(ScriptedProvider::new(VALID_JUDGMENT), audit.clone());

    let started = service.start_conversation().await.unwrap();
    assert_eq!(started.greeting_text, prompts::GREETING);

    let conv = service.conversation(&started.conversation_id).unwrap();
    assert_eq!(conv.phase(), Phase::Gathering);
    assert_eq!(conv.turns().len(), 1);
    assert_eq!(conv.turns()[0].sender, Sender::System);
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_full_scenario_to_judged() {
    let provider = ScriptedProvider::new(VALID_JUDGMENT);
    let service = service(provider.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;

    let sent = qualify(&service, &id).await;
    assert_eq!(sent, 5, "threshold is more than four user turns");
    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.phase(), Phase::AwaitingConfirmation);
    assert_eq!(
        conv.turns().last().unwrap().text,
        prompts::CONFIRMATION_PROMPT
    );

    let confirm = service.send_message(&id, "Yes").await.unwrap();
    assert!(confirm.awaiting_judgment_request);
    assert!(confirm.ready_for_judgment);
    assert!(confirm.reply_text.is_empty());
    let calls_before_judgment = provider.calls.load(Ordering::SeqCst);
    assert_eq!(calls_before_judgment, 5, "affirmation makes no reasoning call");

    let judgment = service.request_judgment(&id).await.unwrap();
    assert!(!judgment.violation_type.is_empty());
    assert_eq!(judgment.severity, Severity::Serious);
    assert_eq!(judgment.severity_label, Severity::Serious.label());
    assert_eq!(judgment.policy_links.len(), 1);
    assert_eq!(judgment.policy_links[0].id, "conduct-7");
    assert_eq!(judgment.policy_links[0].url, "https://policies.example/conduct-7");
    assert_eq!(judgment.unverified_citations, vec!["ghost-99".to_string()]);

    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.phase(), Phase::Judged);
    assert_eq!(conv.latest_judgment(), Some(&judgment));

    let usage = service.usage();
    assert_eq!(usage.llm_calls, 6);
    assert_eq!(usage.total_tokens, 720);
}

#[tokio::test]
async fn test_judgment_on_new_conversation_is_insufficient() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    assert!(matches!(
        service.request_judgment(&id).await,
        Err(ServiceError::InsufficientContext)
    ));
}

#[tokio::test]
async fn test_out_of_range_severity_leaves_phase() {
    let audit = Arc::new(MemoryAuditStore::new());
    let service = service_with(ScriptedProvider::new(OUT_OF_RANGE_JUDGMENT), audit.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;
    qualify(&service, &id).await;
    service.send_message(&id, "yes").await.unwrap();
    let recorded = audit.len();

    let result = service.request_judgment(&id).await;
    assert!(matches!(result, Err(ServiceError::MalformedJudgment(_))));

    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.phase(), Phase::AwaitingConfirmation);
    assert!(conv.judgments().is_empty());
    assert_eq!(audit.len(), recorded);
}

#[tokio::test]
async fn test_retry_after_malformed_judgment() {
    let provider = ScriptedProvider::new(OUT_OF_RANGE_JUDGMENT);
    let service = service(provider.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;
    qualify(&service, &id).await;

    assert!(service.request_judgment(&id).await.is_err());
    provider.script_judgment(VALID_JUDGMENT);
    assert!(service.request_judgment(&id).await.is_ok());
}

#[tokio::test]
async fn test_decline_returns_to_gathering() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    qualify(&service, &id).await;

    let reply = service
        .send_message(&id, "Not yet, there is more to tell")
        .await
        .unwrap();
    assert!(!reply.ready_for_judgment);
    assert!(!reply.awaiting_judgment_request);
    assert!(!reply.reply_text.is_empty());
    assert_eq!(service.conversation(&id).unwrap().phase(), Phase::Gathering);

    // The offer comes back after two more user turns.
    let reply = service.send_message(&id, REPORT).await.unwrap();
    assert!(!reply.ready_for_judgment);
    let reply = service.send_message(&id, REPORT).await.unwrap();
    assert!(reply.ready_for_judgment);
}

#[tokio::test]
async fn test_judged_never_returns_to_gathering() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    qualify(&service, &id).await;
    service.request_judgment(&id).await.unwrap();

    for _ in 0..4 {
        let reply = service.send_message(&id, REPORT).await.unwrap();
        assert!(!reply.ready_for_judgment);
        assert_eq!(service.conversation(&id).unwrap().phase(), Phase::Judged);
    }
    // Re-qualification over the new window.
    let reply = service.send_message(&id, REPORT).await.unwrap();
    assert!(reply.ready_for_judgment);
    assert_eq!(
        service.conversation(&id).unwrap().phase(),
        Phase::AwaitingConfirmation
    );
}

#[tokio::test]
async fn test_rejudgment_needs_new_input() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    qualify(&service, &id).await;
    service.request_judgment(&id).await.unwrap();

    assert!(matches!(
        service.request_judgment(&id).await,
        Err(ServiceError::InsufficientContext)
    ));

    // One more message is new input but not a new offer.
    let reply = service.send_message(&id, REPORT).await.unwrap();
    assert!(!reply.ready_for_judgment);
    assert!(matches!(
        service.request_judgment(&id).await,
        Err(ServiceError::InsufficientContext)
    ));
    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.phase(), Phase::Judged);
    assert_eq!(conv.judgments().len(), 1);
}

#[tokio::test]
async fn test_judgment_before_offer_is_insufficient() {
    let provider = ScriptedProvider::new(VALID_JUDGMENT);
    let service = service(provider.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;

    let reply = service.send_message(&id, "hello").await.unwrap();
    assert!(!reply.ready_for_judgment);
    let calls = provider.calls.load(Ordering::SeqCst);

    assert!(matches!(
        service.request_judgment(&id).await,
        Err(ServiceError::InsufficientContext)
    ));
    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.phase(), Phase::Gathering);
    assert!(conv.judgments().is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_unsupported_upload_is_recorded_and_qualifies() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;

    let upload = service
        .upload_evidence(&id, "capture.xyz", b"\x00\x01\x02binary")
        .await
        .unwrap();
    assert_eq!(upload.status, ExtractionStatus::Failed);
    assert!(upload.detail.is_some());

    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.evidence().len(), 1);
    assert_eq!(conv.phase(), Phase::Gathering);

    // Evidence alone satisfies readiness on the next message.
    let reply = service.send_message(&id, "I attached a file").await.unwrap();
    assert!(reply.ready_for_judgment);
}

#[tokio::test]
async fn test_text_evidence_reaches_judgment() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    let upload = service
        .upload_evidence(&id, "ledger.csv", "date,amount\n2024-03-01,50000000".as_bytes())
        .await
        .unwrap();
    assert_eq!(upload.status, ExtractionStatus::Ok);

    // Evidence qualifies without any keyword in the user's words.
    let reply = service.send_message(&id, "See the attached file").await.unwrap();
    assert!(reply.ready_for_judgment);
    let judgment = service.request_judgment(&id).await.unwrap();
    assert_eq!(judgment.severity, Severity::Serious);
}

#[tokio::test]
async fn test_clear_is_idempotent() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = service.start_conversation().await.unwrap().conversation_id;
    service.send_message(&id, REPORT).await.unwrap();
    service
        .upload_evidence(&id, "notes.txt", b"some notes")
        .await
        .unwrap();

    service.clear_conversation(&id).await.unwrap();
    let first = service.conversation(&id).unwrap();
    service.clear_conversation(&id).await.unwrap();
    let second = service.conversation(&id).unwrap();

    for conv in [&first, &second] {
        assert_eq!(conv.phase(), Phase::Gathering);
        assert!(conv.turns().is_empty());
        assert!(conv.evidence().is_empty());
        assert!(conv.judgments().is_empty());
    }

    // Cleared content is gone from the conversation but not from the audit trail.
    let history = service.audit_history(&id).await.unwrap();
    assert!(history.iter().any(|r| matches!(r.change, Change::Evidence(_))));
    assert_eq!(
        history.iter().filter(|r| r.change == Change::Cleared).count(),
        2
    );
}

#[tokio::test]
async fn test_unknown_conversation_not_found() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let id = ConversationId::from("does-not-exist");
    assert!(matches!(
        service.send_message(&id, "hello").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        service.upload_evidence(&id, "a.txt", b"x").await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        service.request_judgment(&id).await,
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(
        service.clear_conversation(&id).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_operation_is_busy() {
    let provider = Arc::new(GatedProvider {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let service = Arc::new(service(provider.clone()));
    let id = service.start_conversation().await.unwrap().conversation_id;
    let other = service.start_conversation().await.unwrap().conversation_id;

    let in_flight = {
        let service = Arc::clone(&service);
        let id = id.clone();
        tokio::spawn(async move { service.send_message(&id, "first message").await })
    };
    provider.entered.notified().await;

    assert!(matches!(
        service.send_message(&id, "second message").await,
        Err(ServiceError::Busy(_))
    ));
    assert!(matches!(
        service.upload_evidence(&id, "a.txt", b"x").await,
        Err(ServiceError::Busy(_))
    ));
    // Other conversations are unaffected.
    service.clear_conversation(&other).await.unwrap();

    provider.release.notify_one();
    in_flight.await.unwrap().unwrap();

    let conv = service.conversation(&id).unwrap();
    assert_eq!(conv.turns().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reasoning_timeout_leaves_state_unchanged() {
    let service = service(Arc::new(StalledProvider));
    let id = service.start_conversation().await.unwrap().conversation_id;
    let before = service.conversation(&id).unwrap();

    let result = service.send_message(&id, REPORT).await;
    assert!(matches!(result, Err(ServiceError::UpstreamTimeout)));
    assert_eq!(service.conversation(&id).unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_leaves_state_unchanged() {
    let audit = Arc::new(MemoryAuditStore::new());
    let service = service_with(Arc::new(StalledProvider), audit.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;
    let before = service.conversation(&id).unwrap();

    let result = service
        .send_message_within(&id, REPORT, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ServiceError::UpstreamTimeout)));
    assert_eq!(service.conversation(&id).unwrap(), before);
    assert_eq!(audit.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_call_keeps_audit_and_state_in_step() {
    let audit = Arc::new(SlowAudit {
        inner: MemoryAuditStore::new(),
        delay: Duration::from_millis(500),
    });
    let service = service_with(ScriptedProvider::new(VALID_JUDGMENT), audit.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), service.send_message(&id, REPORT)).await;
    assert!(abandoned.is_err());

    // The write that had started finishes and is applied.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let conv = service.conversation(&id).unwrap();
    let audited_turns = service
        .audit_history(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r.change, Change::Turn(_)))
        .count();
    assert_eq!(conv.turns().len(), 3);
    assert_eq!(audited_turns, conv.turns().len());
}

#[tokio::test]
async fn test_missing_index_surfaces() {
    let service = WhistleService::builder()
        .provider(ScriptedProvider::new(VALID_JUDGMENT))
        .build()
        .unwrap();
    let id = service.start_conversation().await.unwrap().conversation_id;

    assert!(matches!(
        service.send_message(&id, REPORT).await,
        Err(ServiceError::IndexUnavailable)
    ));
    assert_eq!(service.conversation(&id).unwrap().turns().len(), 1);

    service.install_index(PolicyIndex::new(vec![]).unwrap());
    assert!(service.send_message(&id, REPORT).await.is_ok());
}

#[tokio::test]
async fn test_audit_failure_commits_nothing() {
    let audit = Arc::new(FlakyAudit::default());
    let service = service_with(ScriptedProvider::new(VALID_JUDGMENT), audit.clone());
    let id = service.start_conversation().await.unwrap().conversation_id;
    let before = service.conversation(&id).unwrap();

    audit.failing.store(true, Ordering::SeqCst);
    assert!(matches!(
        service.send_message(&id, REPORT).await,
        Err(ServiceError::Storage(_))
    ));
    assert!(matches!(
        service.upload_evidence(&id, "a.txt", b"x").await,
        Err(ServiceError::Storage(_))
    ));
    assert_eq!(service.conversation(&id).unwrap(), before);

    audit.failing.store(false, Ordering::SeqCst);
    assert!(service.send_message(&id, REPORT).await.is_ok());
}

#[tokio::test]
async fn test_search_is_deterministic() {
    let service = service(ScriptedProvider::new(VALID_JUDGMENT));
    let first = service.search("moving company funds without approval", 3).await.unwrap();
    let second = service.search("moving company funds without approval", 3).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first[0].policy_id, "conduct-7");
    assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
}
