//! Parsing and validating reasoning-service judgments.
//!
//! Validation runs in a fixed order: JSON extraction, schema, severity
//! range, severity/violation consistency, then citation filtering. Any
//! failure before the citation step rejects the whole judgment; nothing is
//! ever filled in with a default.

use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::validate_judgment_schema;
use crate::types::{JudgmentResult, PolicyLink, RetrievalResult, Severity};

/// Why a raw judgment was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgmentError {
    #[error("response contained no JSON object")]
    NoJson,

    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("schema validation failed: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("severity {0} is outside the 0-3 scale")]
    UnknownSeverity(i64),

    #[error("inconsistent judgment: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Deserialize)]
struct RawJudgment {
    violation_type: Vec<String>,
    severity: i64,
    #[serde(default)]
    severity_label: Option<String>,
    recommended_actions: Vec<String>,
    rationale: String,
    #[serde(default)]
    citations: Vec<RawCitation>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    needs_more_evidence: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCitation {
    Id(String),
    Object { id: String },
}

impl RawCitation {
    fn id(&self) -> &str {
        match self {
            RawCitation::Id(id) => id,
            RawCitation::Object { id } => id,
        }
    }
}

/// Citations split into verified links and everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredCitations {
    pub links: Vec<PolicyLink>,
    pub unverified: Vec<String>,
}

/// Referential check of cited ids against the retrieval set that was shown
/// to the model.
pub struct CitationFilter<'a> {
    retrieved: &'a [RetrievalResult],
}

impl<'a> CitationFilter<'a> {
    pub fn new(retrieved: &'a [RetrievalResult]) -> Self {
        Self { retrieved }
    }

    /// Keep cited ids that were retrieved, in citation order, without
    /// duplicates.
    pub fn filter<'c, I>(&self, cited: I) -> FilteredCitations
    where
        I: IntoIterator<Item = &'c str>,
    {
        let mut seen = HashSet::new();
        let mut out = FilteredCitations::default();
        for id in cited {
            let id = id.trim();
            if id.is_empty() || !seen.insert(id.to_string()) {
                continue;
            }
            match self.retrieved.iter().find(|r| r.policy_id == id) {
                Some(hit) => out.links.push(hit.to_link()),
                None => out.unverified.push(id.to_string()),
            }
        }
        out
    }
}

/// Locate the JSON object in free-form model output.
///
/// A ```` ```json ```` fence wins when present. Otherwise every `{` is a
/// candidate and the first balanced span that parses is taken, so prose
/// such as "in {format}:" before the object is skipped. When nothing
/// parses the first balanced span is returned for the caller to reject.
/// Braces inside string literals are ignored.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let scope = fenced_json(raw)
        .filter(|body| body.contains('{'))
        .unwrap_or(raw);
    candidates(scope)
        .find(|c| serde_json::from_str::<serde_json::Value>(c).is_ok())
        .or_else(|| candidates(scope).next())
}

fn candidates(text: &str) -> impl Iterator<Item = &str> + '_ {
    text.match_indices('{')
        .filter_map(move |(start, _)| balanced_object(&text[start..]))
}

fn fenced_json(raw: &str) -> Option<&str> {
    const FENCE: &str = "```json";
    let open = raw.find(FENCE)?;
    let body = &raw[open + FENCE.len()..];
    let close = body.find("```").unwrap_or(body.len());
    Some(&body[..close])
}

/// The balanced object starting at the first byte of `text`.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// Parse and validate a raw judgment against the retrieval set it was
/// grounded on.
pub fn parse_judgment(
    raw: &str,
    retrieved: &[RetrievalResult],
) -> Result<JudgmentResult, JudgmentError> {
    let json = extract_json_object(raw).ok_or(JudgmentError::NoJson)?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| JudgmentError::InvalidJson(e.to_string()))?;

    validate_judgment_schema(&value).map_err(JudgmentError::Schema)?;

    let parsed: RawJudgment =
        serde_json::from_value(value).map_err(|e| JudgmentError::InvalidJson(e.to_string()))?;

    let severity = Severity::from_ordinal(parsed.severity)
        .ok_or(JudgmentError::UnknownSeverity(parsed.severity))?;

    let violation_type = clean_list(parsed.violation_type);
    match (severity, violation_type.is_empty()) {
        (Severity::NoViolation, false) => {
            return Err(JudgmentError::Inconsistent(
                "severity 0 with violation types listed".to_string(),
            ))
        }
        (s, true) if s != Severity::NoViolation => {
            return Err(JudgmentError::Inconsistent(format!(
                "severity {} with no violation type",
                s.ordinal()
            )))
        }
        _ => {}
    }

    let rationale = parsed.rationale.trim().to_string();
    if rationale.is_empty() {
        return Err(JudgmentError::Inconsistent("empty rationale".to_string()));
    }

    if let Some(label) = parsed.severity_label.as_deref() {
        if label != severity.label() && label != severity.label_ko() {
            debug!(model_label = label, "Replacing model severity label with canonical label");
        }
    }

    let filtered = CitationFilter::new(retrieved).filter(parsed.citations.iter().map(|c| c.id()));
    if !filtered.unverified.is_empty() {
        warn!(
            dropped = filtered.unverified.len(),
            "Dropped citations that were not in the retrieval set"
        );
    }

    Ok(JudgmentResult {
        violation_type,
        severity,
        severity_label: severity.label().to_string(),
        recommended_actions: clean_list(parsed.recommended_actions),
        rationale,
        policy_links: filtered.links,
        confidence: parsed.confidence,
        needs_more_evidence: parsed.needs_more_evidence,
        unverified_citations: filtered.unverified,
        judged_at: Utc::now(),
    })
}
