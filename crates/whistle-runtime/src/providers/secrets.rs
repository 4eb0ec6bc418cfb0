//! API key handling for vendor providers.
//!
//! Keys are wrapped in [`SecretString`] as soon as they are read and only
//! exposed when an HTTP header is built.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A vendor API key. `Debug` and `Display` never show the value.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    label: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, label: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            label,
        }
    }

    /// Read `config[key]`, falling back to the `env_var` environment variable.
    pub fn from_config_or_env(
        config: &JsonValue,
        key: &str,
        env_var: &str,
        label: &'static str,
    ) -> Result<Self, ProviderError> {
        if let Some(value) = config[key].as_str() {
            return Ok(Self::new(value, CredentialSource::Config, label));
        }
        match std::env::var(env_var) {
            Ok(value) => Ok(Self::new(value, CredentialSource::Environment, label)),
            Err(_) => Err(ProviderError::NotConfigured(format!(
                "{} required: set '{}' in config or the {} environment variable",
                label, key, env_var
            ))),
        }
    }

    /// Whether a key could be loaded, without loading it.
    pub fn is_available(config: &JsonValue, key: &str, env_var: &str) -> bool {
        config[key].as_str().is_some() || std::env::var(env_var).is_ok()
    }

    /// The raw value. Call only where the request header is built.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("label", &self.label)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.label, self.source)
    }
}
