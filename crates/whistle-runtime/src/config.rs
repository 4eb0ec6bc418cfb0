//! Runtime configuration.
//!
//! Loaded from YAML; every section and field has a default so an empty
//! document is a valid configuration. Durations use humantime strings
//! (`"30s"`, `"2h"`).
//!
//! ```yaml
//! readiness:
//!   user_turn_threshold: 4
//! retrieval:
//!   reply_k: 3
//!   embedding_timeout: 10s
//! reasoning:
//!   model: claude-sonnet-4-5
//!   timeout: 30s
//! conversation:
//!   ttl: 2h
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use whistle_core::ReadinessPolicy;

use crate::providers::CompletionConfig;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub readiness: ReadinessPolicy,
    pub retrieval: RetrievalConfig,
    pub reasoning: ReasoningConfig,
    pub evidence: EvidenceConfig,
    pub conversation: ConversationConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Passages retrieved to ground each reply (3 to 5)
    pub reply_k: usize,

    /// Passages retrieved to ground a judgment
    pub judgment_k: usize,

    #[serde(with = "humantime_duration")]
    pub embedding_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            reply_k: 3,
            judgment_k: 5,
            embedding_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,

    /// Deadline for each reasoning call
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,

    /// Most recent turns included in reply prompts
    pub history_window: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout: Duration::from_secs(30),
            history_window: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Uploads larger than this are recorded as FAILED
    pub max_bytes: usize,

    /// Characters of each evidence item included in prompts
    pub max_chars_in_prompt: usize,

    /// Mask personal identifiers before text leaves the process
    pub mask_pii: bool,

    /// Deadline for OCR of one image
    #[serde(with = "humantime_duration")]
    pub ocr_timeout: Duration,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            max_chars_in_prompt: 6000,
            mask_pii: true,
            ocr_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Idle time after which a conversation is discarded
    #[serde(with = "humantime_duration")]
    pub ttl: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,

    #[serde(with = "humantime_duration")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(3..=5).contains(&self.retrieval.reply_k) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.reply_k must be between 3 and 5, got {}",
                self.retrieval.reply_k
            )));
        }
        if self.retrieval.judgment_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.judgment_k must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reasoning.temperature) {
            return Err(ConfigError::Invalid(format!(
                "reasoning.temperature must be within 0.0..=1.0, got {}",
                self.reasoning.temperature
            )));
        }
        if self.reasoning.max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "reasoning.max_tokens must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("retrieval.embedding_timeout", self.retrieval.embedding_timeout),
            ("reasoning.timeout", self.reasoning.timeout),
            ("evidence.ocr_timeout", self.evidence.ocr_timeout),
            ("conversation.ttl", self.conversation.ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.evidence.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "evidence.max_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Completion settings for reasoning calls.
    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            model: self.reasoning.model.clone(),
            max_tokens: self.reasoning.max_tokens,
            temperature: self.reasoning.temperature,
            timeout: self.reasoning.timeout,
        }
    }
}

/// Serde adapter for `Duration` as a humantime string.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
