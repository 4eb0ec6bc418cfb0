//! OpenAI-compatible `/embeddings` endpoint.

use super::{
    embedding::EmbeddingProvider,
    factory::EmbeddingFactory,
    secrets::ApiCredential,
    ProviderError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSION: usize = 1536;

/// Remote embedder. Works with any service exposing the OpenAI
/// embeddings wire format.
pub struct OpenAiEmbedder {
    credential: ApiCredential,
    base_url: String,
    model: String,
    dimension: usize,
    name: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl OpenAiEmbedder {
    /// Config keys: `api_key` (else `OPENAI_API_KEY`), `base_url`, `model`,
    /// `dimension`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            config,
            "api_key",
            OPENAI_API_KEY_ENV,
            "OpenAI API key",
        )?;
        let model = config["model"].as_str().unwrap_or(DEFAULT_MODEL).to_string();
        let dimension = config["dimension"]
            .as_u64()
            .map(|d| d as usize)
            .unwrap_or(DEFAULT_DIMENSION);
        let base_url = config["base_url"]
            .as_str()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            name: format!("openai-{}", model),
            credential,
            base_url,
            model,
            dimension,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| ProviderError::ParseError("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: (self.dimension != DEFAULT_DIMENSION).then_some(self.dimension),
        };
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(self.credential.expose())
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 {
            return Err(ProviderError::AuthError);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(ProviderError::ParseError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Factory for `"openai"`.
pub struct OpenAiEmbedderFactory;

impl EmbeddingFactory for OpenAiEmbedderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        Ok(Arc::new(OpenAiEmbedder::from_config(config)?))
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible embeddings endpoint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let embedder = OpenAiEmbedder::from_config(&serde_json::json!({"api_key": "k"})).unwrap();
        assert_eq!(embedder.dimension(), DEFAULT_DIMENSION);
        assert_eq!(embedder.name(), "openai-text-embedding-3-small");
        assert!(!format!("{:?}", embedder).contains("\"k\""));
    }

    #[test]
    fn test_custom_dimension_and_url() {
        let embedder = OpenAiEmbedder::from_config(&serde_json::json!({
            "api_key": "k",
            "dimension": 256,
            "base_url": "http://localhost:8080/v1/"
        }))
        .unwrap();
        assert_eq!(embedder.dimension(), 256);
        assert_eq!(embedder.base_url, "http://localhost:8080/v1");
    }
}
