//! # whistle-core
//!
//! Deterministic building blocks for the whistle-blower intake assistant.
//!
//! This crate holds everything that does not talk to the network:
//! - the conversation state machine and its readiness heuristic
//! - consent detection for the judgment offer
//! - the policy index, chunking and similarity ranking
//! - evidence text extraction
//! - judgment parsing, schema validation and citation filtering
//! - PII masking
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: ranking, readiness and validation are pure functions
//! 2. **No LLM calls**: reasoning and embedding live in `whistle-runtime`
//! 3. **No fabricated verdicts**: a judgment either validates or is rejected
//!
//! ## Example
//!
//! ```rust,ignore
//! use whistle_core::{parse_judgment, PolicyIndex};
//!
//! let index = PolicyIndex::load_jsonl("policies.jsonl")?;
//! let hits = index.rank(&query_vector, 5)?;
//! let judgment = parse_judgment(&model_output, &hits)?;
//! println!("{}: {}", judgment.severity_label, judgment.rationale);
//! ```

pub mod chunking;
pub mod consent;
pub mod conversation;
pub mod extract;
pub mod index;
pub mod judgment;
pub mod patterns;
pub mod readiness;
pub mod schema;
pub mod types;

pub use chunking::{chunk_text, PolicyDocument, PolicySection, DEFAULT_CHUNK_CHARS};
pub use consent::{ConsentGate, TokenConsent};
pub use conversation::{Change, Conversation, TransitionError};
pub use extract::{detect_kind, extract, Extraction, ExtractionError};
pub use index::{cosine_similarity, similarity, IndexError, PolicyIndex};
pub use judgment::{extract_json_object, parse_judgment, CitationFilter, JudgmentError};
pub use patterns::{detect_categories, mask_pii, ViolationCategory};
pub use readiness::{Readiness, ReadinessPolicy, ReadinessReason};
pub use types::{
    ConversationId, EvidenceItem, EvidenceKind, ExtractionStatus, JudgmentResult, Phase,
    PolicyEntry, PolicyLink, RetrievalResult, Sender, Severity, Turn,
};
