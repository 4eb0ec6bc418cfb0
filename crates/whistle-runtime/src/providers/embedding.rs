//! Text embedding backends.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::ProviderError;

/// Output dimension of [`HashingEmbedder`] unless configured otherwise.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

/// Maps text to a fixed-length vector.
///
/// The same text must always map to the same vector for a given
/// provider; the index is only comparable with queries embedded by the
/// provider that built it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts. The default calls [`embed`](Self::embed) in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Stable name, recorded in logs and used as the cache namespace.
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// Signed feature hashing over word tokens, plus character bigrams for
/// non-ASCII words so Korean stems match across particles.
///
/// No network, fully deterministic. Good enough for keyword-heavy policy
/// text and for tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    name: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            name: format!("hashing-{}", dimension),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }

    /// Deterministic embedding; the async trait method delegates here.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            if token.is_ascii() {
                if token.len() < 2 {
                    continue;
                }
                self.add_feature(&mut vector, token, 1.0);
            } else {
                self.add_feature(&mut vector, token, 1.0);
                let chars: Vec<char> = token.chars().collect();
                for pair in chars.windows(2) {
                    let bigram: String = pair.iter().collect();
                    self.add_feature(&mut vector, &bigram, 0.5);
                }
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
