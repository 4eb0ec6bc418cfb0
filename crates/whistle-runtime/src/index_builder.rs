//! Offline index construction from policy documents.
//!
//! Sources are a directory of `.txt`, `.md`, `.pdf` files and `.jsonl`
//! files of pre-chunked records (`{"doc_id", "section"?, "title"?, "url"?,
//! "text"}`). Each source becomes a [`PolicyDocument`], is chunked, embedded
//! in batches and collected into a [`PolicyIndex`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use whistle_core::{
    chunking::PolicySection, extract, ExtractionStatus, IndexError, PolicyDocument, PolicyEntry,
    PolicyIndex, DEFAULT_CHUNK_CHARS,
};

use crate::providers::{EmbeddingProvider, ProviderError};

/// Errors building an index.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: invalid record: {message}")]
    Record {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("embedder returned {actual} vectors for {expected} passages")]
    EmbeddingCount { expected: usize, actual: usize },

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Deserialize)]
struct SourceRecord {
    doc_id: String,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    text: String,
}

/// Chunks and embeds policy documents.
pub struct IndexBuilder {
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_chars: usize,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            batch_size: 32,
        }
    }

    pub fn chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Chunk, embed and index `documents`.
    pub async fn build(&self, documents: &[PolicyDocument]) -> Result<PolicyIndex, BuildError> {
        let sections: Vec<PolicySection> = documents
            .iter()
            .flat_map(|doc| doc.sections(self.chunk_chars))
            .collect();
        self.build_from_sections(sections).await
    }

    /// Embed already-chunked sections.
    pub async fn build_from_sections(
        &self,
        sections: Vec<PolicySection>,
    ) -> Result<PolicyIndex, BuildError> {
        let mut entries: Vec<PolicyEntry> = Vec::with_capacity(sections.len());
        let mut pending = sections.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<PolicySection> = pending.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(BuildError::EmbeddingCount {
                    expected: batch.len(),
                    actual: vectors.len(),
                });
            }
            entries.extend(
                batch
                    .into_iter()
                    .zip(vectors)
                    .map(|(section, vector)| section.into_entry(vector)),
            );
        }

        let index = PolicyIndex::new(entries)?;
        info!(
            entries = index.len(),
            embedder = self.embedder.name(),
            fingerprint = index.fingerprint(),
            "Built policy index"
        );
        Ok(index)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Load every supported source under `dir` (non-recursive, sorted by name
/// so builds are reproducible).
pub fn load_sources(dir: impl AsRef<Path>) -> Result<Vec<PolicySection>, BuildError> {
    load_sources_with(dir, DEFAULT_CHUNK_CHARS)
}

pub fn load_sources_with(
    dir: impl AsRef<Path>,
    chunk_chars: usize,
) -> Result<Vec<PolicySection>, BuildError> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut sections = Vec::new();
    for path in paths {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jsonl" => sections.extend(load_jsonl_records(&path, chunk_chars)?),
            "txt" | "md" | "pdf" => {
                if let Some(doc) = load_document(&path)? {
                    sections.extend(doc.sections(chunk_chars));
                }
            }
            _ => {}
        }
    }
    Ok(sections)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read one text or PDF policy file. Files without extractable text are
/// skipped with a warning.
pub fn load_document(path: &Path) -> Result<Option<PolicyDocument>, BuildError> {
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    let name = file_name(path);
    let extraction = extract(&name, &bytes);
    if extraction.status == ExtractionStatus::Failed {
        warn!(file = %name, reason = ?extraction.error, "Skipping policy source without text");
        return Ok(None);
    }
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    Ok(Some(PolicyDocument {
        doc_id: name,
        title,
        url: String::new(),
        text: extraction.text,
    }))
}

fn load_jsonl_records(path: &Path, chunk_chars: usize) -> Result<Vec<PolicySection>, BuildError> {
    let content = std::fs::read_to_string(path).map_err(io_error(path))?;
    let mut sections = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: SourceRecord =
            serde_json::from_str(line).map_err(|e| BuildError::Record {
                path: path.to_path_buf(),
                line: i + 1,
                message: e.to_string(),
            })?;
        let doc = PolicyDocument {
            title: record.title.unwrap_or_else(|| record.doc_id.clone()),
            url: record.url.unwrap_or_default(),
            doc_id: record.doc_id,
            text: record.text,
        };
        match record.section {
            Some(section) => {
                let text = whistle_core::chunking::normalize_passage(&doc.text);
                if text.is_empty() {
                    continue;
                }
                sections.push(PolicySection {
                    id: PolicyEntry::stable_id(&doc.doc_id, &section, &text),
                    title: doc.title,
                    section,
                    text,
                    citation_url: doc.url,
                });
            }
            None => sections.extend(doc.sections(chunk_chars)),
        }
    }
    Ok(sections)
}
