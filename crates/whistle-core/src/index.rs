//! The read-only policy index and similarity ranking.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{PolicyEntry, RetrievalResult};

/// Errors loading, building or querying an index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid entry: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate policy id {0}")]
    DuplicateId(String),

    #[error("policy {id} has embedding dimension {actual}, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("query vector has dimension {actual}, index expects {expected}")]
    QueryDimension { expected: usize, actual: usize },

    #[error("policy {0} has an empty embedding")]
    EmptyEmbedding(String),
}

/// An immutable collection of policy entries with a shared embedding
/// dimension. Swapped wholesale on rebuild, never edited in place.
#[derive(Debug, Clone)]
pub struct PolicyIndex {
    entries: Vec<PolicyEntry>,
    dimension: usize,
    fingerprint: String,
}

impl PolicyIndex {
    pub fn new(entries: Vec<PolicyEntry>) -> Result<Self, IndexError> {
        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        let mut ids = HashSet::with_capacity(entries.len());
        let mut hasher = Sha256::new();
        for entry in &entries {
            if entry.embedding.is_empty() {
                return Err(IndexError::EmptyEmbedding(entry.id.clone()));
            }
            if entry.embedding.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    id: entry.id.clone(),
                    expected: dimension,
                    actual: entry.embedding.len(),
                });
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(IndexError::DuplicateId(entry.id.clone()));
            }
            hasher.update(entry.id.as_bytes());
            hasher.update([0u8]);
        }
        let fingerprint = hex::encode(hasher.finalize())[..16].to_string();
        Ok(Self {
            entries,
            dimension,
            fingerprint,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Short digest of the entry ids, for logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&PolicyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Top `k` entries by similarity to `query`.
    ///
    /// Results are in non-increasing score order with ties broken by
    /// ascending id, so equal inputs always give equal output.
    pub fn rank(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>, IndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(IndexError::QueryDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(f32, &PolicyEntry)> = self
            .entries
            .iter()
            .map(|entry| (similarity(query, &entry.embedding), entry))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, entry))| RetrievalResult {
                policy_id: entry.id.clone(),
                title: entry.title.clone(),
                section: entry.section.clone(),
                citation_url: entry.citation_url.clone(),
                text: entry.text.clone(),
                score,
                rank: i + 1,
            })
            .collect())
    }

    /// Load one JSON entry per line. Blank lines are skipped.
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        Self::from_jsonl_reader(BufReader::new(file))
    }

    pub fn from_jsonl_reader<R: BufRead>(reader: R) -> Result<Self, IndexError> {
        let mut entries = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: PolicyEntry = serde_json::from_str(&line)
                .map_err(|source| IndexError::Json { line: i + 1, source })?;
            entries.push(entry);
        }
        Self::new(entries)
    }

    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_jsonl_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_jsonl_to<W: Write>(&self, writer: &mut W) -> Result<(), IndexError> {
        for (i, entry) in self.entries.iter().enumerate() {
            let line = serde_json::to_string(entry)
                .map_err(|source| IndexError::Json { line: i + 1, source })?;
            writeln!(writer, "{}", line)?;
        }
        Ok(())
    }
}

/// Cosine similarity between two vectors of equal length.
/// Zero vectors have similarity 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine similarity clamped into [0, 1]. Anti-correlated passages are as
/// irrelevant as orthogonal ones.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let cos = cosine_similarity(a, b);
    if cos.is_nan() {
        0.0
    } else {
        cos.clamp(0.0, 1.0)
    }
}
