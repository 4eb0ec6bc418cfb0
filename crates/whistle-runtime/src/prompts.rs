//! Prompts and request assembly for the reasoning service.
//!
//! Two requests leave the process:
//! 1. Counselling replies: system prompt, retrieved policy context, and a
//!    bounded window of recent turns.
//! 2. Judgments: system prompt with the output contract, plus one user
//!    message carrying the transcript, evidence, category hints and the
//!    retrieved passages tagged with their ids.
//!
//! When PII masking is enabled, user text and evidence are masked here.
//! Stored turns and evidence keep the original text.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt::Write;

use whistle_core::{
    mask_pii, Conversation, EvidenceItem, ExtractionStatus, RetrievalResult, Sender, Severity,
    Turn, ViolationCategory,
};

use crate::config::EvidenceConfig;
use crate::providers::ChatMessage;

/// Greeting appended as the first SYSTEM turn of every conversation.
pub const GREETING: &str = "Hello, this is the confidential internal reporting service. \
What would you like to report? Please describe the situation in as much detail as you can.\n\n\
Everything you share is kept strictly confidential and your identity is protected.";

/// Offer appended once the readiness heuristic is satisfied.
pub const CONFIRMATION_PROMPT: &str = "I think I have enough information to prepare an \
assessment of this matter against our internal policies. Would you like me to do that now? \
You can also keep adding details or upload further evidence first.";

/// Counsellor persona for conversational replies.
pub const SYSTEM_PROMPT: &str = r#"
You are the intake counsellor of an internal whistle-blowing service. You help an anonymous
employee describe a suspected violation of internal policy, such as embezzlement, breach of
fiduciary duty, mis-selling, conflicts of interest or leaks of customer data.

You answer with reference to the policy passages supplied with each message. You did not
memorise the policies: when asked where your information comes from, explain that you look up
the most relevant provisions for every question.

## Principles
1. Stay fair and objective; do not accuse or reassure prematurely
2. Collect facts and evidence carefully
3. Ground statements in the supplied policies and cite their titles
4. Protect personal information; never ask for the reporter's identity
5. Apply ethical standards strictly

## Make sure you learn
- The concrete facts of what happened
- The employees or departments involved
- When it happened and for how long
- Whether any evidence exists and what form it takes
- Whether it was already reported internally

Keep replies short. Ask at most two questions at a time. Reply in the language the reporter
uses. Do not deliver a verdict: a formal assessment is produced separately.
"#;

/// System prompt for the judgment request.
pub const JUDGE_SYSTEM_PROMPT: &str = r#"
You assess whistle-blower reports against internal policy. You receive a transcript, any
evidence extracted from uploaded files, and a numbered list of policy passages, each with an id.

Respond with a single JSON object and nothing else:
{
  "violation_type": ["string"],
  "severity": 0,
  "severity_label": "string",
  "recommended_actions": ["string"],
  "rationale": "string",
  "citations": ["policy id"],
  "confidence": 0.0,
  "needs_more_evidence": false
}

## Severity
- 0: no policy violation (violation_type must be empty)
- 1: minor violation, caution or training required
- 2: serious violation, investigation or audit required
- 3: critical violation, immediate action or legal review required
Any severity above 0 needs at least one violation_type.

## Rules
1. Base the assessment only on the transcript, the evidence and the listed passages
2. Cite passages by their exact id; cite nothing that is not listed
3. Evidence marked "content unavailable" exists but could not be read; do not guess its contents
4. confidence is a number between 0 and 1
5. Set needs_more_evidence when the facts are too thin for a firm conclusion
6. Recommended actions are concrete steps such as training, correction, audit referral or legal review
"#;

fn prepare(text: &str, mask: bool) -> Cow<'_, str> {
    if mask {
        Cow::Owned(mask_pii(text))
    } else {
        Cow::Borrowed(text)
    }
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => Cow::Owned(format!("{} [truncated]", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

/// Render retrieved passages for a prompt, each tagged with its id.
pub fn render_policy_context(policies: &[RetrievalResult]) -> String {
    if policies.is_empty() {
        return "(no relevant policy passages were found)".to_string();
    }
    let mut out = String::new();
    for hit in policies {
        let _ = writeln!(
            out,
            "[{}] id={} | {} ({}) | relevance {:.2}",
            hit.rank, hit.policy_id, hit.title, hit.section, hit.score
        );
        let _ = writeln!(out, "{}\n", hit.text.trim());
    }
    out
}

fn turn_message(turn: &Turn, mask: bool) -> ChatMessage {
    match turn.sender {
        Sender::User => ChatMessage::user(prepare(&turn.text, mask)),
        Sender::System => ChatMessage::assistant(turn.text.as_str()),
    }
}

/// Messages for a conversational reply.
///
/// The last `history_window` turns are included; the conversation is
/// expected to end with the USER turn being answered.
pub fn reply_messages(
    conversation: &Conversation,
    policies: &[RetrievalResult],
    history_window: usize,
    evidence: &EvidenceConfig,
) -> Vec<ChatMessage> {
    let mut context = String::from("Relevant policy passages:\n\n");
    context.push_str(&render_policy_context(policies));

    let pool = conversation.evidence();
    if !pool.is_empty() {
        context.push_str("\nEvidence received so far:\n");
        for item in pool {
            let _ = writeln!(context, "- {} ({})", item.filename, item.status);
        }
    }

    let mut messages = vec![
        ChatMessage::system(SYSTEM_PROMPT.trim()),
        ChatMessage::system(context),
    ];

    let turns = conversation.turns();
    let start = turns.len().saturating_sub(history_window.max(1));
    messages.extend(
        turns[start..]
            .iter()
            .map(|t| turn_message(t, evidence.mask_pii)),
    );
    messages
}

fn render_evidence(out: &mut String, items: &[EvidenceItem], config: &EvidenceConfig) {
    if items.is_empty() {
        out.push_str("(no evidence submitted)\n");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let _ = writeln!(
            out,
            "--- Evidence {}: {} [{}] ---",
            i + 1,
            item.filename,
            item.status
        );
        if item.has_content() {
            let text = prepare(&item.text, config.mask_pii);
            let _ = writeln!(out, "{}", truncate_chars(&text, config.max_chars_in_prompt));
            if item.status == ExtractionStatus::Partial {
                out.push_str("(partially extracted)\n");
            }
        } else {
            let _ = writeln!(
                out,
                "content unavailable: {}",
                item.failure_reason.as_deref().unwrap_or("no text extracted")
            );
        }
    }
}

/// Messages for a judgment request.
pub fn judgment_messages(
    conversation: &Conversation,
    policies: &[RetrievalResult],
    categories: &BTreeSet<ViolationCategory>,
    evidence: &EvidenceConfig,
) -> Vec<ChatMessage> {
    let mut body = String::from("## Transcript\n");
    for turn in conversation.turns() {
        let (tag, text) = match turn.sender {
            Sender::User => ("[USER]", prepare(&turn.text, evidence.mask_pii)),
            Sender::System => ("[SYSTEM]", Cow::Borrowed(turn.text.as_str())),
        };
        let _ = writeln!(body, "{} {}", tag, text);
    }

    body.push_str("\n## Evidence\n");
    render_evidence(&mut body, conversation.evidence(), evidence);

    body.push_str("\n## Detected categories\n");
    if categories.is_empty() {
        body.push_str("(none detected)\n");
    } else {
        let names: Vec<&str> = categories.iter().map(|c| c.display_name()).collect();
        let _ = writeln!(body, "{}", names.join(", "));
    }

    body.push_str("\n## Policy passages\n");
    body.push_str(&render_policy_context(policies));

    body.push_str("\n## Severity labels\n");
    for severity in Severity::ALL {
        let _ = writeln!(body, "{}: {}", severity.ordinal(), severity.label());
    }

    vec![
        ChatMessage::system(JUDGE_SYSTEM_PROMPT.trim()),
        ChatMessage::user(body),
    ]
}

const MAX_QUERY_CHARS: usize = 2000;

/// Retrieval query for a judgment.
///
/// Every USER turn in the conversation, most recent last, so a re-judgment
/// is grounded in the whole account and not just what followed the last
/// verdict. With no user turns, readable evidence text stands in. Long
/// queries keep their most recent characters.
pub fn synthesize_query(conversation: &Conversation, mask: bool) -> String {
    let from_turns: Vec<&str> = conversation
        .user_turns()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .collect();

    let joined = if from_turns.is_empty() {
        conversation
            .evidence()
            .iter()
            .filter(|e| e.has_content())
            .map(|e| e.text.trim())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        from_turns.join("\n")
    };

    let query = prepare(&joined, mask);
    let excess = query.chars().count().saturating_sub(MAX_QUERY_CHARS);
    query.chars().skip(excess).collect()
}
