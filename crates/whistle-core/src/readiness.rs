//! Readiness heuristic: has enough been said to offer a judgment?

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::patterns::{detect_categories, ViolationCategory};
use crate::types::Phase;

/// Thresholds for offering a judgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    /// USER turns in the window must exceed this count
    pub user_turn_threshold: usize,

    /// Also require at least one violation-category cue
    pub require_keyword: bool,

    /// After a decline, USER turns required before offering again
    pub reprompt_after_turns: usize,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            user_turn_threshold: 4,
            require_keyword: true,
            reprompt_after_turns: 2,
        }
    }
}

/// Why readiness was (or was not) reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessReason {
    EvidencePresent,
    ConversationDepth,
    NotEnoughInput,
    NoViolationCue,
    RecentlyDeclined,
    AlreadyOffered,
}

/// Result of evaluating a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub reason: ReadinessReason,
    pub categories: BTreeSet<ViolationCategory>,
}

impl ReadinessPolicy {
    /// Evaluate the qualification window of `conversation`.
    ///
    /// Evidence in the window qualifies on its own. Otherwise the window
    /// needs more USER turns than the threshold and, when configured, at
    /// least one category cue. A prior decline suppresses the offer until
    /// `reprompt_after_turns` more USER turns or new evidence arrive.
    pub fn evaluate(&self, conversation: &Conversation) -> Readiness {
        let categories = window_categories(conversation);

        if conversation.phase() == Phase::AwaitingConfirmation {
            return Readiness {
                ready: false,
                reason: ReadinessReason::AlreadyOffered,
                categories,
            };
        }

        let user_turns = conversation.window_user_turns();
        let evidence = conversation.window_evidence().len();

        let reason = if evidence > 0 {
            ReadinessReason::EvidencePresent
        } else if user_turns <= self.user_turn_threshold {
            ReadinessReason::NotEnoughInput
        } else if self.require_keyword && categories.is_empty() {
            ReadinessReason::NoViolationCue
        } else {
            ReadinessReason::ConversationDepth
        };

        let mut ready = matches!(
            reason,
            ReadinessReason::EvidencePresent | ReadinessReason::ConversationDepth
        );

        let mut reason = reason;
        if ready {
            if let Some(mark) = conversation.declined() {
                let new_turns = user_turns.saturating_sub(mark.user_turns);
                let new_evidence = evidence > mark.evidence;
                if new_turns < self.reprompt_after_turns && !new_evidence {
                    ready = false;
                    reason = ReadinessReason::RecentlyDeclined;
                }
            }
        }

        Readiness {
            ready,
            reason,
            categories,
        }
    }
}

/// Category cues across USER turns and evidence text in the window.
pub fn window_categories(conversation: &Conversation) -> BTreeSet<ViolationCategory> {
    let mut found = BTreeSet::new();
    for turn in conversation.window_turns().iter().filter(|t| t.is_user()) {
        found.extend(detect_categories(&turn.text));
    }
    for item in conversation.window_evidence() {
        found.extend(detect_categories(&item.text));
    }
    found
}
