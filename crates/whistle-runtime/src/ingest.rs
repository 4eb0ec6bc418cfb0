//! Evidence ingestion: size limits, provenance, extraction and optional OCR.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use whistle_core::{
    extract, EvidenceItem, EvidenceKind, Extraction, ExtractionError, ExtractionStatus,
};

use crate::providers::ProviderError;

/// Optical character recognition for image evidence.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Turns raw uploads into [`EvidenceItem`]s. Never fails: every problem is
/// recorded on the item.
#[derive(Clone)]
pub struct EvidenceIngestor {
    ocr: Option<Arc<dyn OcrEngine>>,
    max_bytes: usize,
    ocr_timeout: Duration,
}

impl EvidenceIngestor {
    pub fn new(max_bytes: usize, ocr_timeout: Duration) -> Self {
        Self {
            ocr: None,
            max_bytes,
            ocr_timeout,
        }
    }

    pub fn with_ocr(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    pub async fn ingest(&self, filename: &str, bytes: &[u8]) -> EvidenceItem {
        let sha256 = hex::encode(Sha256::digest(bytes));

        let extraction = if bytes.len() > self.max_bytes {
            Extraction::failed(
                whistle_core::detect_kind(filename, &bytes[..bytes.len().min(64)]),
                ExtractionError::TooLarge {
                    size: bytes.len(),
                    limit: self.max_bytes,
                },
            )
        } else {
            let extraction = extract(filename, bytes);
            if extraction.kind == EvidenceKind::Image {
                self.recognize(bytes).await
            } else {
                extraction
            }
        };

        match extraction.status {
            ExtractionStatus::Ok => debug!(kind = ?extraction.kind, "Evidence extracted"),
            _ => warn!(
                kind = ?extraction.kind,
                status = %extraction.status,
                reason = ?extraction.error.as_ref().map(|e| e.to_string()),
                "Evidence extraction incomplete"
            ),
        }

        EvidenceItem {
            filename: filename.to_string(),
            kind: extraction.kind,
            text: extraction.text,
            status: extraction.status,
            failure_reason: extraction.error.map(|e| e.to_string()),
            byte_len: bytes.len(),
            sha256,
            ingested_at: Utc::now(),
        }
    }

    async fn recognize(&self, bytes: &[u8]) -> Extraction {
        let Some(engine) = &self.ocr else {
            return Extraction::failed(EvidenceKind::Image, ExtractionError::OcrUnavailable);
        };
        match tokio::time::timeout(self.ocr_timeout, engine.recognize(bytes)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Extraction::ok(EvidenceKind::Image, text),
            Ok(Ok(_)) => Extraction::failed(EvidenceKind::Image, ExtractionError::NoText),
            Ok(Err(e)) => {
                warn!(engine = engine.name(), error = %e, "OCR failed");
                Extraction::failed(EvidenceKind::Image, ExtractionError::Corrupt(e.to_string()))
            }
            Err(_) => Extraction::failed(
                EvidenceKind::Image,
                ExtractionError::Corrupt(format!("ocr timed out after {:?}", self.ocr_timeout)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOcr(&'static str);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, _image: &[u8]) -> Result<String, ProviderError> {
            Ok(self.0.to_string())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nrest-of-image";

    #[tokio::test]
    async fn test_text_evidence_with_provenance() {
        let ingestor = EvidenceIngestor::new(1024, Duration::from_secs(1));
        let item = ingestor.ingest("ledger.txt", b"wire 5,000,000 KRW").await;
        assert_eq!(item.status, ExtractionStatus::Ok);
        assert_eq!(item.byte_len, 18);
        assert_eq!(item.sha256.len(), 64);
        assert!(item.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_image_without_ocr_fails_but_is_recorded() {
        let ingestor = EvidenceIngestor::new(1024, Duration::from_secs(1));
        let item = ingestor.ingest("receipt.png", PNG).await;
        assert_eq!(item.kind, EvidenceKind::Image);
        assert_eq!(item.status, ExtractionStatus::Failed);
        assert_eq!(item.failure_reason.as_deref(), Some("ocr unavailable"));
        assert!(item.text.is_empty());
    }

    #[tokio::test]
    async fn test_image_with_ocr() {
        let ingestor = EvidenceIngestor::new(1024, Duration::from_secs(1))
            .with_ocr(Arc::new(FixedOcr("Approved by: nobody")));
        let item = ingestor.ingest("receipt.png", PNG).await;
        assert_eq!(item.status, ExtractionStatus::Ok);
        assert_eq!(item.text, "Approved by: nobody");
    }

    #[tokio::test]
    async fn test_oversized_upload_fails() {
        let ingestor = EvidenceIngestor::new(4, Duration::from_secs(1));
        let item = ingestor.ingest("big.txt", b"0123456789").await;
        assert_eq!(item.status, ExtractionStatus::Failed);
        assert!(item.failure_reason.unwrap().contains("too large"));
        assert_eq!(item.byte_len, 10);
    }
}
