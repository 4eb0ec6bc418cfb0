//! Shared detection patterns.
//!
//! Two families live here: personal identifiers that are masked before text
//! leaves the process, and violation-category cues that feed the readiness
//! heuristic and the judgment prompt. Category cues are bilingual
//! (English and Korean) because reports arrive in either.

use std::collections::BTreeSet;
use std::fmt;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

lazy_static! {
    // =========================================================================
    // PII PATTERNS
    // =========================================================================

    /// Email address pattern (RFC 5322 simplified)
    pub static ref EMAIL_PATTERN: Regex = Regex::new(
        r"([a-zA-Z0-9._%+-]+)@([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})"
    ).unwrap();

    /// Korean resident registration number (YYMMDD-GNNNNNN)
    pub static ref RRN_PATTERN: Regex = Regex::new(
        r"\b(\d{6})[- ]?([1-4]\d{6})\b"
    ).unwrap();

    /// Credit card number (16 digits with optional separators)
    pub static ref CREDIT_CARD_PATTERN: Regex = Regex::new(
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?(\d{4})\b"
    ).unwrap();

    /// Korean mobile and landline numbers
    pub static ref KR_PHONE_PATTERN: Regex = Regex::new(
        r"\b(01[016789]|0\d{1,2})[- .]?(\d{3,4})[- .]?(\d{4})\b"
    ).unwrap();

    /// US phone number (with optional country code)
    pub static ref US_PHONE_PATTERN: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\([0-9]{3}\)|\b[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?([0-9]{4})\b"
    ).unwrap();

    /// Account-number-like digit runs (10 to 14 digits, optionally hyphenated)
    pub static ref ACCOUNT_PATTERN: Regex = Regex::new(
        r"\b\d{3,6}-\d{2,6}-\d{4,8}\b"
    ).unwrap();

    // =========================================================================
    // VIOLATION CATEGORY CUES
    // =========================================================================

    static ref EMBEZZLEMENT_PATTERN: Regex = Regex::new(
        r"(?i)\b(embezzl\w*|misappropriat\w*|siphon\w*|slush\s+funds?|transferr?(?:ed|ing|s)?\s+(?:the\s+)?(?:company\s+|client\s+|customer\s+|branch\s+)?(?:funds|money))|횡령|유용|착복"
    ).unwrap();

    static ref BREACH_OF_DUTY_PATTERN: Regex = Regex::new(
        r"(?i)\b(breach(?:es|ed)?\s+of\s+(?:fiduciary\s+)?duty|fiduciary|without\s+(?:any\s+)?(?:approval|authori[sz]ation)|unauthori[sz]ed|abuse\s+of\s+(?:authority|position)|forg(?:ed|ery|ing))|배임|무단|위조"
    ).unwrap();

    static ref MIS_SELLING_PATTERN: Regex = Regex::new(
        r"(?i)\b(mis-?sell\w*|mis-?sold|pressur(?:ed|ing)\s+\w+\s+(?:to\s+)?(?:buy|sign)|hid(?:e|den|ing)?\s+(?:the\s+)?(?:fees|risks?)|unsuitable\s+products?)|불완전\s*판매|강매|꺾기"
    ).unwrap();

    static ref CONFLICT_OF_INTEREST_PATTERN: Regex = Regex::new(
        r"(?i)\b(conflicts?\s+of\s+interest|kickbacks?|brib\w*|self-?dealing|insider\s+trading)|이해\s*상충|뇌물|리베이트|금품"
    ).unwrap();

    static ref DATA_LEAK_PATTERN: Regex = Regex::new(
        r"(?i)\b(leak\w*|data\s+breach|exfiltrat\w*|(?:customer|client|personal)\s+(?:data|information|records))|개인\s*정보|유출|누설"
    ).unwrap();
}

/// Categories of misconduct the assistant listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Embezzlement,
    BreachOfDuty,
    MisSelling,
    ConflictOfInterest,
    DataLeak,
}

impl ViolationCategory {
    pub const ALL: [ViolationCategory; 5] = [
        ViolationCategory::Embezzlement,
        ViolationCategory::BreachOfDuty,
        ViolationCategory::MisSelling,
        ViolationCategory::ConflictOfInterest,
        ViolationCategory::DataLeak,
    ];

    fn pattern(self) -> &'static Regex {
        match self {
            ViolationCategory::Embezzlement => &EMBEZZLEMENT_PATTERN,
            ViolationCategory::BreachOfDuty => &BREACH_OF_DUTY_PATTERN,
            ViolationCategory::MisSelling => &MIS_SELLING_PATTERN,
            ViolationCategory::ConflictOfInterest => &CONFLICT_OF_INTEREST_PATTERN,
            ViolationCategory::DataLeak => &DATA_LEAK_PATTERN,
        }
    }

    /// Human-readable name used in prompts.
    pub fn display_name(self) -> &'static str {
        match self {
            ViolationCategory::Embezzlement => "Embezzlement",
            ViolationCategory::BreachOfDuty => "Breach of duty",
            ViolationCategory::MisSelling => "Mis-selling",
            ViolationCategory::ConflictOfInterest => "Conflict of interest",
            ViolationCategory::DataLeak => "Data leak",
        }
    }
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Categories whose cues appear in `content`.
pub fn detect_categories(content: &str) -> BTreeSet<ViolationCategory> {
    ViolationCategory::ALL
        .into_iter()
        .filter(|c| c.pattern().is_match(content))
        .collect()
}

/// Check if content contains any personal identifiers.
pub fn contains_pii(content: &str) -> bool {
    EMAIL_PATTERN.is_match(content)
        || RRN_PATTERN.is_match(content)
        || CREDIT_CARD_PATTERN.is_match(content)
        || KR_PHONE_PATTERN.is_match(content)
        || US_PHONE_PATTERN.is_match(content)
        || ACCOUNT_PATTERN.is_match(content)
}

/// Mask personal identifiers, keeping just enough to tell values apart.
///
/// Order matters: registration and card numbers go before phone numbers, and
/// phone numbers before the generic account pattern.
pub fn mask_pii(content: &str) -> String {
    let masked = EMAIL_PATTERN.replace_all(content, |caps: &Captures| {
        let local = &caps[1];
        let first: String = local.chars().take(1).collect();
        format!("{}***@{}", first, &caps[2])
    });
    let masked = RRN_PATTERN.replace_all(&masked, "$1-*******");
    let masked = CREDIT_CARD_PATTERN.replace_all(&masked, "****-****-****-$1");
    let masked = KR_PHONE_PATTERN.replace_all(&masked, "$1-****-$3");
    let masked = US_PHONE_PATTERN.replace_all(&masked, "***-***-$1");
    let masked = ACCOUNT_PATTERN.replace_all(&masked, "***-***-****");
    masked.into_owned()
}
