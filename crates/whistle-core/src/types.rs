//! Domain types shared by the conversation state machine, the policy index
//! and the judgment pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Opaque, unguessable conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh random identifier (122 bits of entropy).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sender {
    System,
    User,
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::System,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }
}

/// Outcome of text extraction for one evidence file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "PARTIAL")]
    Partial,
    #[serde(rename = "FAILED")]
    Failed,
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionStatus::Ok => write!(f, "OK"),
            ExtractionStatus::Partial => write!(f, "PARTIAL"),
            ExtractionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Detected evidence file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Text,
    Pdf,
    Email,
    Image,
    Unsupported,
}

/// A file attached to a conversation, with provenance.
///
/// A failed extraction is still an item: the judgment sees
/// "evidence present, content unavailable" rather than nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Original filename as supplied by the reporter
    pub filename: String,

    /// Detected format
    pub kind: EvidenceKind,

    /// Extracted plain text (empty when extraction failed)
    pub text: String,

    /// Extraction outcome
    pub status: ExtractionStatus,

    /// Why extraction was partial or failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Size of the raw upload in bytes
    pub byte_len: usize,

    /// Hex SHA-256 of the raw upload
    pub sha256: String,

    pub ingested_at: DateTime<Utc>,
}

impl EvidenceItem {
    /// Whether any text is available to show the reasoning service.
    pub fn has_content(&self) -> bool {
        self.status != ExtractionStatus::Failed && !self.text.trim().is_empty()
    }
}

/// Conversation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Gathering,
    AwaitingConfirmation,
    Judged,
}

impl Phase {
    /// Legal phase edges. `clear` is not an edge: it resets the conversation.
    ///
    /// JUDGED is only reached from AWAITING_CONFIRMATION. It never goes back
    /// to GATHERING; new input after a judgment has to re-qualify, which
    /// moves it to AWAITING_CONFIRMATION.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Gathering, AwaitingConfirmation)
                | (AwaitingConfirmation, Gathering)
                | (AwaitingConfirmation, Judged)
                | (Judged, AwaitingConfirmation)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Gathering => write!(f, "GATHERING"),
            Phase::AwaitingConfirmation => write!(f, "AWAITING_CONFIRMATION"),
            Phase::Judged => write!(f, "JUDGED"),
        }
    }
}

/// One indexed policy passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Stable identifier, see [`PolicyEntry::stable_id`]
    pub id: String,

    /// Document title
    pub title: String,

    /// Clause or section label within the document
    pub section: String,

    /// Normalized passage text
    pub text: String,

    /// Embedding vector
    pub embedding: Vec<f32>,

    /// Source URL or citation string
    #[serde(default)]
    pub citation_url: String,
}

impl PolicyEntry {
    /// Identifier derived from the source document, the section label and
    /// the passage text. It only changes when the source text changes.
    pub fn stable_id(doc_id: &str, section: &str, text: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        format!("{}#{}@{}", doc_id, section, &hex::encode(digest)[..8])
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub policy_id: String,
    pub title: String,
    pub section: String,
    pub citation_url: String,
    pub text: String,

    /// Similarity in [0, 1]
    pub score: f32,

    /// 1-based rank
    pub rank: usize,
}

impl RetrievalResult {
    pub fn to_link(&self) -> PolicyLink {
        PolicyLink {
            id: self.policy_id.clone(),
            title: if self.section.is_empty() {
                self.title.clone()
            } else {
                format!("{} ({})", self.title, self.section)
            },
            url: self.citation_url.clone(),
        }
    }
}

/// A verified citation in a judgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLink {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Closed severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    NoViolation,
    Minor,
    Serious,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::NoViolation,
        Severity::Minor,
        Severity::Serious,
        Severity::Critical,
    ];

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            0 => Some(Severity::NoViolation),
            1 => Some(Severity::Minor),
            2 => Some(Severity::Serious),
            3 => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            Severity::NoViolation => 0,
            Severity::Minor => 1,
            Severity::Serious => 2,
            Severity::Critical => 3,
        }
    }

    /// Canonical English label.
    pub fn label(self) -> &'static str {
        match self {
            Severity::NoViolation => "No policy violation",
            Severity::Minor => "Minor violation (caution or training required)",
            Severity::Serious => "Serious violation (investigation or audit required)",
            Severity::Critical => "Critical violation (immediate action or legal review required)",
        }
    }

    /// Canonical Korean label.
    pub fn label_ko(self) -> &'static str {
        match self {
            Severity::NoViolation => "규정 위반 없음",
            Severity::Minor => "경미한 위반 (주의 또는 교육 필요)",
            Severity::Serious => "중대한 위반 (조사 또는 감사 필요)",
            Severity::Critical => "심각한 위반 (즉시 처분 또는 법적 조치 필요)",
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Severity::from_ordinal(value)
            .ok_or_else(|| de::Error::custom(format!("unknown severity ordinal {}", value)))
    }
}

/// The structured verdict for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    /// Violation labels; empty means "no violation"
    pub violation_type: Vec<String>,

    pub severity: Severity,

    /// Always the canonical label for `severity`
    pub severity_label: String,

    pub recommended_actions: Vec<String>,

    pub rationale: String,

    /// Citations verified against the retrieval set (never null)
    pub policy_links: Vec<PolicyLink>,

    /// Model-reported confidence in [0, 1], when supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub needs_more_evidence: bool,

    /// Citations the model produced that were not in the retrieval set
    #[serde(default)]
    pub unverified_citations: Vec<String>,

    pub judged_at: DateTime<Utc>,
}

impl JudgmentResult {
    pub fn is_violation(&self) -> bool {
        !self.violation_type.is_empty()
    }

    pub fn cited_ids(&self) -> impl Iterator<Item = &str> {
        self.policy_links.iter().map(|l| l.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_ids_are_unique_and_opaque() {
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_judged_never_returns_to_gathering() {
        assert!(!Phase::Judged.can_transition_to(Phase::Gathering));
        assert!(Phase::Judged.can_transition_to(Phase::AwaitingConfirmation));
        assert!(Phase::AwaitingConfirmation.can_transition_to(Phase::Gathering));
        assert!(!Phase::Gathering.can_transition_to(Phase::Gathering));
    }

    #[test]
    fn test_judged_only_after_offer() {
        assert!(Phase::AwaitingConfirmation.can_transition_to(Phase::Judged));
        assert!(!Phase::Gathering.can_transition_to(Phase::Judged));
        assert!(!Phase::Judged.can_transition_to(Phase::Judged));
    }

    #[test]
    fn test_severity_round_trips_as_integer() {
        let json = serde_json::to_string(&Severity::Serious).unwrap();
        assert_eq!(json, "2");
        let parsed: Severity = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Severity::Critical);
        assert!(serde_json::from_str::<Severity>("7").is_err());
    }

    #[test]
    fn test_stable_id_depends_on_text() {
        let a = PolicyEntry::stable_id("code.pdf", "Article 3", "Funds require dual approval.");
        let b = PolicyEntry::stable_id("code.pdf", "Article 3", "Funds require dual approval.");
        let c = PolicyEntry::stable_id("code.pdf", "Article 3", "Funds require single approval.");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("code.pdf#Article 3@"));
    }

    #[test]
    fn test_extraction_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&ExtractionStatus::Partial).unwrap(), "\"PARTIAL\"");
        assert_eq!(ExtractionStatus::Failed.to_string(), "FAILED");
    }
}
