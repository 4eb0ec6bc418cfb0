//! The per-conversation state machine.
//!
//! All mutation goes through [`Conversation::apply`] with a list of
//! [`Change`]s. Callers build the change list, apply it to a clone, persist
//! it, and only then swap the clone in; a failure at any step leaves the
//! live conversation untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConversationId, EvidenceItem, JudgmentResult, Phase, Turn};

/// Invalid state-machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal phase transition {from} -> {to}")]
    Illegal { from: Phase, to: Phase },
}

/// One atomic unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    Turn(Turn),
    Evidence(EvidenceItem),
    Phase { from: Phase, to: Phase },
    Judgment(JudgmentResult),
    Cleared,
}

/// Where the current qualification window starts.
///
/// The window covers turns and evidence added since the last judgment (or
/// since the start of the conversation). Readiness only looks inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStart {
    pub turn: usize,
    pub evidence: usize,
}

/// Counters captured when the reporter declined a judgment offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineMark {
    pub user_turns: usize,
    pub evidence: usize,
}

/// One intake session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    id: ConversationId,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    phase: Phase,
    turns: Vec<Turn>,
    evidence: Vec<EvidenceItem>,
    judgments: Vec<JudgmentResult>,
    window: WindowStart,
    declined: Option<DeclineMark>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            phase: Phase::Gathering,
            turns: Vec::new(),
            evidence: Vec::new(),
            judgments: Vec::new(),
            window: WindowStart::default(),
            declined: None,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn judgments(&self) -> &[JudgmentResult] {
        &self.judgments
    }

    pub fn latest_judgment(&self) -> Option<&JudgmentResult> {
        self.judgments.last()
    }

    pub fn declined(&self) -> Option<DeclineMark> {
        self.declined
    }

    /// Turns since the last judgment.
    pub fn window_turns(&self) -> &[Turn] {
        &self.turns[self.window.turn.min(self.turns.len())..]
    }

    /// Evidence since the last judgment.
    pub fn window_evidence(&self) -> &[EvidenceItem] {
        &self.evidence[self.window.evidence.min(self.evidence.len())..]
    }

    pub fn window_user_turns(&self) -> usize {
        self.window_turns().iter().filter(|t| t.is_user()).count()
    }

    pub fn user_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.is_user())
    }

    /// Whether there is anything new a judgment could be based on.
    ///
    /// Before the first judgment this is "any USER turn or any evidence";
    /// afterwards only input since the last judgment counts.
    pub fn has_judgeable_input(&self) -> bool {
        self.window_user_turns() > 0 || !self.window_evidence().is_empty()
    }

    /// Apply a batch of changes in order. Stops at the first illegal change;
    /// callers apply to a clone so partial application is never observed.
    pub fn apply(&mut self, changes: &[Change]) -> Result<(), TransitionError> {
        for change in changes {
            self.apply_one(change)?;
        }
        Ok(())
    }

    /// Apply a single change.
    pub fn apply_one(&mut self, change: &Change) -> Result<(), TransitionError> {
        match change {
            Change::Turn(turn) => {
                self.last_activity = turn.timestamp.max(self.last_activity);
                self.turns.push(turn.clone());
            }
            Change::Evidence(item) => {
                self.last_activity = item.ingested_at.max(self.last_activity);
                self.evidence.push(item.clone());
            }
            Change::Phase { from, to } => {
                if *from != self.phase || !from.can_transition_to(*to) {
                    return Err(TransitionError::Illegal {
                        from: self.phase,
                        to: *to,
                    });
                }
                if *from == Phase::AwaitingConfirmation && *to == Phase::Gathering {
                    self.declined = Some(DeclineMark {
                        user_turns: self.window_user_turns(),
                        evidence: self.window_evidence().len(),
                    });
                }
                self.phase = *to;
            }
            Change::Judgment(result) => {
                if !self.phase.can_transition_to(Phase::Judged) {
                    return Err(TransitionError::Illegal {
                        from: self.phase,
                        to: Phase::Judged,
                    });
                }
                self.phase = Phase::Judged;
                self.judgments.push(result.clone());
                self.window = WindowStart {
                    turn: self.turns.len(),
                    evidence: self.evidence.len(),
                };
                self.declined = None;
                self.last_activity = result.judged_at.max(self.last_activity);
            }
            Change::Cleared => {
                self.phase = Phase::Gathering;
                self.turns.clear();
                self.evidence.clear();
                self.judgments.clear();
                self.window = WindowStart::default();
                self.declined = None;
                self.last_activity = Utc::now();
            }
        }
        Ok(())
    }

    /// Build a phase change from the current phase.
    pub fn phase_change(&self, to: Phase) -> Change {
        Change::Phase {
            from: self.phase,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvidenceKind, ExtractionStatus, Severity};

    fn evidence(name: &str) -> EvidenceItem {
        EvidenceItem {
            filename: name.to_string(),
            kind: EvidenceKind::Text,
            text: "ledger".to_string(),
            status: ExtractionStatus::Ok,
            failure_reason: None,
            byte_len: 6,
            sha256: "00".to_string(),
            ingested_at: Utc::now(),
        }
    }

    fn judgment() -> JudgmentResult {
        JudgmentResult {
            violation_type: vec![],
            severity: Severity::NoViolation,
            severity_label: Severity::NoViolation.label().to_string(),
            recommended_actions: vec![],
            rationale: "nothing found".to_string(),
            policy_links: vec![],
            confidence: None,
            needs_more_evidence: false,
            unverified_citations: vec![],
            judged_at: Utc::now(),
        }
    }

    fn offer(conv: &Conversation) -> Change {
        conv.phase_change(Phase::AwaitingConfirmation)
    }

    #[test]
    fn test_new_conversation_is_gathering() {
        let conv = Conversation::new(ConversationId::generate());
        assert_eq!(conv.phase(), Phase::Gathering);
        assert!(conv.turns().is_empty());
        assert!(!conv.has_judgeable_input());
    }

    #[test]
    fn test_greeting_alone_is_not_judgeable() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[Change::Turn(Turn::system("hello"))]).unwrap();
        assert!(!conv.has_judgeable_input());
        conv.apply(&[Change::Turn(Turn::user("my manager..."))]).unwrap();
        assert!(conv.has_judgeable_input());
    }

    #[test]
    fn test_illegal_transition_rejected_without_side_effects() {
        let mut conv = Conversation::new(ConversationId::generate());
        let before = conv.clone();
        let err = conv
            .apply_one(&Change::Phase {
                from: Phase::Gathering,
                to: Phase::Gathering,
            })
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: Phase::Gathering,
                to: Phase::Gathering
            }
        );
        assert_eq!(conv, before);
    }

    #[test]
    fn test_stale_from_phase_rejected() {
        let mut conv = Conversation::new(ConversationId::generate());
        let stale = Change::Phase {
            from: Phase::AwaitingConfirmation,
            to: Phase::Gathering,
        };
        assert!(conv.apply_one(&stale).is_err());
    }

    #[test]
    fn test_judgment_requires_offer() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[Change::Turn(Turn::user("x"))]).unwrap();
        let before = conv.clone();
        assert_eq!(
            conv.apply_one(&Change::Judgment(judgment())),
            Err(TransitionError::Illegal {
                from: Phase::Gathering,
                to: Phase::Judged
            })
        );
        assert_eq!(conv, before);
    }

    #[test]
    fn test_judged_cannot_be_judged_again() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[Change::Turn(Turn::user("x"))]).unwrap();
        conv.apply(&[offer(&conv), Change::Judgment(judgment())]).unwrap();
        conv.apply(&[Change::Turn(Turn::user("one more thing"))]).unwrap();
        assert!(conv.apply_one(&Change::Judgment(judgment())).is_err());
        assert_eq!(conv.judgments().len(), 1);
    }

    #[test]
    fn test_judged_cannot_return_to_gathering() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[Change::Turn(Turn::user("x"))]).unwrap();
        conv.apply(&[offer(&conv), Change::Judgment(judgment())]).unwrap();
        assert_eq!(conv.phase(), Phase::Judged);
        let back = conv.phase_change(Phase::Gathering);
        assert!(conv.apply_one(&back).is_err());
        let reopen = conv.phase_change(Phase::AwaitingConfirmation);
        assert!(conv.apply_one(&reopen).is_ok());
    }

    #[test]
    fn test_judgment_resets_window() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[
            Change::Turn(Turn::user("a")),
            Change::Evidence(evidence("a.txt")),
            Change::Phase {
                from: Phase::Gathering,
                to: Phase::AwaitingConfirmation,
            },
            Change::Judgment(judgment()),
        ])
        .unwrap();
        assert_eq!(conv.window_user_turns(), 0);
        assert!(conv.window_evidence().is_empty());
        assert!(!conv.has_judgeable_input());
        assert_eq!(conv.evidence().len(), 1);

        conv.apply(&[Change::Evidence(evidence("b.txt"))]).unwrap();
        assert!(conv.has_judgeable_input());
    }

    #[test]
    fn test_decline_records_mark() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[
            Change::Turn(Turn::user("a")),
            Change::Turn(Turn::user("b")),
            Change::Phase {
                from: Phase::Gathering,
                to: Phase::AwaitingConfirmation,
            },
            Change::Phase {
                from: Phase::AwaitingConfirmation,
                to: Phase::Gathering,
            },
        ])
        .unwrap();
        assert_eq!(
            conv.declined(),
            Some(DeclineMark {
                user_turns: 2,
                evidence: 0
            })
        );
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut conv = Conversation::new(ConversationId::generate());
        conv.apply(&[
            Change::Turn(Turn::user("a")),
            Change::Evidence(evidence("a.txt")),
            Change::Phase {
                from: Phase::Gathering,
                to: Phase::AwaitingConfirmation,
            },
            Change::Judgment(judgment()),
        ])
        .unwrap();
        conv.apply(&[Change::Cleared]).unwrap();
        let once = (conv.phase(), conv.turns().len(), conv.evidence().len());
        conv.apply(&[Change::Cleared]).unwrap();
        let twice = (conv.phase(), conv.turns().len(), conv.evidence().len());
        assert_eq!(once, (Phase::Gathering, 0, 0));
        assert_eq!(once, twice);
        assert!(conv.judgments().is_empty());
    }

    #[test]
    fn test_change_serializes_tagged() {
        let json = serde_json::to_value(Change::Cleared).unwrap();
        assert_eq!(json["change"], "cleared");
    }
}
