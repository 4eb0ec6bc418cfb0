//! Affirmative-response detection for the judgment offer.
//!
//! The matcher is deliberately narrow: the whole message, after
//! normalization, must be one of the known tokens. "Yes, but he also..." is
//! treated as more reporting, not as consent.

use std::collections::BTreeSet;

/// Decides whether a user message accepts the offer to run a judgment.
pub trait ConsentGate: Send + Sync {
    fn is_affirmative(&self, text: &str) -> bool;
}

/// Default affirmative tokens (English and Korean).
pub const DEFAULT_AFFIRMATIVES: &[&str] = &[
    "yes",
    "y",
    "yeah",
    "yep",
    "yes please",
    "sure",
    "ok",
    "okay",
    "confirm",
    "proceed",
    "go ahead",
    "please proceed",
    "네",
    "예",
    "응",
    "좋아요",
    "네 진행해주세요",
    "진행해주세요",
    "진행",
];

/// Exact-match consent over a fixed token set.
#[derive(Debug, Clone)]
pub struct TokenConsent {
    tokens: BTreeSet<String>,
}

impl TokenConsent {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens.into_iter().map(|t| normalize(t.as_ref())).collect(),
        }
    }
}

impl Default for TokenConsent {
    fn default() -> Self {
        Self::new(DEFAULT_AFFIRMATIVES)
    }
}

impl ConsentGate for TokenConsent {
    fn is_affirmative(&self, text: &str) -> bool {
        let normalized = normalize(text);
        !normalized.is_empty() && self.tokens.contains(&normalized)
    }
}

/// Lowercase, drop punctuation and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .to_lowercase();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
