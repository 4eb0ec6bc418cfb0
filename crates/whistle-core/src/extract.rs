//! Plain-text extraction from uploaded evidence.
//!
//! Extraction never fails the upload. Every outcome, including corrupt and
//! unsupported files, becomes an [`Extraction`] with a status; the caller
//! records it as evidence either way.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{EvidenceKind, ExtractionStatus};

/// Why text could not be (fully) extracted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("file appears corrupt: {0}")]
    Corrupt(String),

    #[error("no extractable text")]
    NoText,

    #[error("ocr unavailable")]
    OcrUnavailable,

    #[error("file too large: {size} bytes exceeds {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("contains undecodable bytes")]
    Lossy,
}

/// Result of extracting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub kind: EvidenceKind,
    pub text: String,
    pub status: ExtractionStatus,
    pub error: Option<ExtractionError>,
}

impl Extraction {
    pub fn ok(kind: EvidenceKind, text: String) -> Self {
        Self {
            kind,
            text,
            status: ExtractionStatus::Ok,
            error: None,
        }
    }

    pub fn partial(kind: EvidenceKind, text: String, error: ExtractionError) -> Self {
        Self {
            kind,
            text,
            status: ExtractionStatus::Partial,
            error: Some(error),
        }
    }

    pub fn failed(kind: EvidenceKind, error: ExtractionError) -> Self {
        Self {
            kind,
            text: String::new(),
            status: ExtractionStatus::Failed,
            error: Some(error),
        }
    }

    /// Ok when there is text, Failed(NoText) otherwise.
    fn from_text(kind: EvidenceKind, text: String) -> Self {
        if text.trim().is_empty() {
            Self::failed(kind, ExtractionError::NoText)
        } else {
            Self::ok(kind, text)
        }
    }
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "csv", "tsv", "log", "json", "xml", "html", "htm", "yaml",
    "yml",
];
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp", "heic",
];

/// Detect the evidence kind from magic bytes, then the extension, then by
/// sniffing for UTF-8 text.
pub fn detect_kind(filename: &str, bytes: &[u8]) -> EvidenceKind {
    if bytes.starts_with(b"%PDF-") {
        return EvidenceKind::Pdf;
    }
    if is_image_magic(bytes) {
        return EvidenceKind::Image;
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => EvidenceKind::Pdf,
        "eml" => EvidenceKind::Email,
        e if TEXT_EXTENSIONS.contains(&e) => EvidenceKind::Text,
        e if IMAGE_EXTENSIONS.contains(&e) => EvidenceKind::Image,
        "" => {
            if looks_like_email(bytes) {
                EvidenceKind::Email
            } else if std::str::from_utf8(bytes).is_ok() && !bytes.contains(&0) {
                EvidenceKind::Text
            } else {
                EvidenceKind::Unsupported
            }
        }
        _ => EvidenceKind::Unsupported,
    }
}

fn is_image_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || bytes.starts_with(b"II*\0")
        || bytes.starts_with(b"MM\0*")
        || (bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
}

fn looks_like_email(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(2048)]);
    let lower = head.to_ascii_lowercase();
    (lower.starts_with("from:") || lower.contains("\nfrom:"))
        && (lower.contains("\nsubject:") || lower.starts_with("subject:"))
}

/// Extract text from `bytes`. Images always come back as
/// `Failed(OcrUnavailable)`; OCR is a runtime concern layered on top.
pub fn extract(filename: &str, bytes: &[u8]) -> Extraction {
    let kind = detect_kind(filename, bytes);
    debug!(kind = ?kind, byte_len = bytes.len(), "Extracting evidence");
    match kind {
        EvidenceKind::Text => extract_plain(bytes),
        EvidenceKind::Pdf => extract_pdf(bytes),
        EvidenceKind::Email => extract_email(bytes),
        EvidenceKind::Image => Extraction::failed(kind, ExtractionError::OcrUnavailable),
        EvidenceKind::Unsupported => {
            let ext = Path::new(filename)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("unknown");
            Extraction::failed(kind, ExtractionError::Unsupported(ext.to_string()))
        }
    }
}

/// Decode as UTF-8. Invalid sequences are replaced; if more than a tenth of
/// the characters had to be replaced the file is treated as binary.
fn decode_text(bytes: &[u8]) -> Result<(String, bool), ExtractionError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok((s.to_string(), false)),
        Err(_) => {
            let lossy = String::from_utf8_lossy(bytes).into_owned();
            let total = lossy.chars().count().max(1);
            let replaced = lossy.chars().filter(|c| *c == char::REPLACEMENT_CHARACTER).count();
            if replaced * 10 > total {
                Err(ExtractionError::Corrupt("not a text file".to_string()))
            } else {
                Ok((lossy, true))
            }
        }
    }
}

fn extract_plain(bytes: &[u8]) -> Extraction {
    match decode_text(bytes) {
        Ok((text, false)) => Extraction::from_text(EvidenceKind::Text, text),
        Ok((text, true)) => Extraction::partial(EvidenceKind::Text, text, ExtractionError::Lossy),
        Err(e) => Extraction::failed(EvidenceKind::Text, e),
    }
}

fn extract_pdf(bytes: &[u8]) -> Extraction {
    // The PDF parser panics on some malformed inputs.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    match outcome {
        Ok(Ok(text)) => Extraction::from_text(EvidenceKind::Pdf, text),
        Ok(Err(e)) => {
            warn!(error = %e, "PDF extraction failed");
            Extraction::failed(EvidenceKind::Pdf, ExtractionError::Corrupt(e.to_string()))
        }
        Err(_) => {
            warn!("PDF parser panicked");
            Extraction::failed(
                EvidenceKind::Pdf,
                ExtractionError::Corrupt("unreadable PDF structure".to_string()),
            )
        }
    }
}

/// Headers surfaced from an email, in this order.
const EMAIL_HEADERS: &[&str] = &["From", "To", "Cc", "Date", "Subject"];

fn extract_email(bytes: &[u8]) -> Extraction {
    let (raw, lossy) = match decode_text(bytes) {
        Ok(decoded) => decoded,
        Err(e) => return Extraction::failed(EvidenceKind::Email, e),
    };
    let raw = raw.replace("\r\n", "\n");
    let (head, body) = match raw.split_once("\n\n") {
        Some((head, body)) => (head, body),
        None => (raw.as_str(), ""),
    };
    let headers = parse_headers(head);
    if headers.is_empty() {
        return match lossy {
            false => Extraction::from_text(EvidenceKind::Email, raw.clone()),
            true => Extraction::partial(EvidenceKind::Email, raw.clone(), ExtractionError::Lossy),
        };
    }

    let mut text = String::new();
    for name in EMAIL_HEADERS {
        if let Some(value) = header(&headers, name) {
            text.push_str(&format!("{}: {}\n", name, value));
        }
    }
    text.push('\n');
    text.push_str(body.trim());

    if lossy {
        Extraction::partial(EvidenceKind::Email, text, ExtractionError::Lossy)
    } else {
        Extraction::ok(EvidenceKind::Email, text)
    }
}

/// Parse an RFC 5322 header block, unfolding continuation lines.
pub fn parse_headers(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() && !name.contains(' ') {
                headers.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    headers
}

/// Last value for a header, matched case-insensitively.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
