//! Splitting policy documents into indexable passages.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::PolicyEntry;

/// Default maximum passage length in characters.
pub const DEFAULT_CHUNK_CHARS: usize = 1024;

lazy_static! {
    static ref BLANK_LINES: Regex = Regex::new(r"\n\s*\n").unwrap();
    static ref INLINE_WS: Regex = Regex::new(r"[ \t\r\f\v]+").unwrap();
    static ref HEADING: Regex = Regex::new(
        r"^(?i:(Article|Section|Clause|Chapter)\s+\d+(?:\.\d+)*)|^제\s*\d+\s*(?:조|장|항)"
    ).unwrap();
}

/// A source policy document before chunking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Stable document identifier, usually the file name
    pub doc_id: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub text: String,
}

/// A passage ready for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySection {
    pub id: String,
    pub title: String,
    pub section: String,
    pub text: String,
    pub citation_url: String,
}

impl PolicySection {
    pub fn into_entry(self, embedding: Vec<f32>) -> PolicyEntry {
        PolicyEntry {
            id: self.id,
            title: self.title,
            section: self.section,
            text: self.text,
            embedding,
            citation_url: self.citation_url,
        }
    }
}

impl PolicyDocument {
    /// Split into sections of at most `max_chars` characters.
    ///
    /// Paragraphs starting with a clause heading ("Article 12", "제12조")
    /// take that heading as their section label; everything else is
    /// labelled `chunk_<n>`. Labels are unique within a document.
    pub fn sections(&self, max_chars: usize) -> Vec<PolicySection> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (i, piece) in chunk_text(&self.text, max_chars).into_iter().enumerate() {
            let mut label = HEADING
                .find(&piece)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| format!("chunk_{}", i));
            if !seen.insert(label.clone()) {
                label = format!("{}-{}", label, i);
                seen.insert(label.clone());
            }
            out.push(PolicySection {
                id: PolicyEntry::stable_id(&self.doc_id, &label, &piece),
                title: self.title.clone(),
                section: label,
                text: piece,
                citation_url: self.url.clone(),
            });
        }
        out
    }
}

/// Collapse runs of inline whitespace and trim each line.
pub fn normalize_passage(text: &str) -> String {
    text.lines()
        .map(|line| INLINE_WS.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split on blank lines, then cut paragraphs longer than `max_chars` at
/// character boundaries, preferring the last whitespace before the limit.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let text = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    for paragraph in BLANK_LINES.split(&text) {
        let paragraph = normalize_passage(paragraph);
        if paragraph.is_empty() {
            continue;
        }
        let chars: Vec<char> = paragraph.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let mut end = (start + max_chars).min(chars.len());
            if end < chars.len() {
                if let Some(ws) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                    if ws > 0 {
                        end = start + ws;
                    }
                }
            }
            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
            start = end;
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_on_blank_lines() {
        let chunks = chunk_text("first para\nstill first\n\n\nsecond   para\n", 1024);
        assert_eq!(chunks, vec!["first para\nstill first", "second para"]);
    }

    #[test]
    fn test_long_paragraph_cut_at_whitespace() {
        let text = "alpha beta gamma delta";
        let chunks = chunk_text(text, 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn test_korean_text_cut_on_char_boundaries() {
        let text = "가".repeat(30);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() == 10));
    }

    #[test]
    fn test_section_labels_from_headings() {
        let doc = PolicyDocument {
            doc_id: "code.md".to_string(),
            title: "Code of Conduct".to_string(),
            url: "https://intranet.example/code".to_string(),
            text: "Article 3 Funds\nTransfers need dual approval.\n\nGeneral remarks.\n\n제12조 정보보호\n고객정보 유출 금지".to_string(),
        };
        let sections = doc.sections(1024);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].section, "Article 3");
        assert_eq!(sections[1].section, "chunk_1");
        assert_eq!(sections[2].section, "제12조");
        assert!(sections[0].id.starts_with("code.md#Article 3@"));
    }

    #[test]
    fn test_duplicate_labels_disambiguated() {
        let doc = PolicyDocument {
            doc_id: "d".to_string(),
            title: "t".to_string(),
            url: String::new(),
            text: "Article 1 a\n\nArticle 1 b".to_string(),
        };
        let sections = doc.sections(1024);
        assert_eq!(sections[0].section, "Article 1");
        assert_eq!(sections[1].section, "Article 1-1");
    }

    proptest! {
        #[test]
        fn prop_chunks_respect_limit(text in "[a-z \n]{0,400}", max in 1usize..64) {
            for chunk in chunk_text(&text, max) {
                prop_assert!(chunk.chars().count() <= max);
                prop_assert!(!chunk.is_empty());
            }
        }
    }
}
