//! Provider credentials and HTTP client for the built-in model client.
//!
//! The manager is intentionally simple — it holds API keys and a shared HTTP
//! client. Which model a generation uses is decided by the chat profile, not
//! here.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use anyhow::Context as _;

// Default API endpoints per provider (used when no base_url is configured).
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
const DEFAULT_MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";

/// Manages provider credentials and the shared HTTP client.
pub struct LlmManager {
    config: LlmConfig,
    http_client: reqwest::Client,
}

impl LlmManager {
    /// Create a new manager with the given configuration.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the appropriate API key for a provider.
    pub fn get_api_key(&self, provider: &str) -> Result<String, LlmError> {
        match provider {
            "openai" => self
                .config
                .openai_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("openai".into())),
            "openrouter" => self
                .config
                .openrouter_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("openrouter".into())),
            "deepseek" => self
                .config
                .deepseek_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("deepseek".into())),
            "mistral" => self
                .config
                .mistral_key
                .clone()
                .ok_or_else(|| LlmError::MissingProviderKey("mistral".into())),
            _ => Err(LlmError::UnknownProvider(provider.into())),
        }
    }

    /// Get the base URL for a provider, falling back to the default.
    pub fn get_base_url(&self, provider: &str) -> Result<&str, LlmError> {
        match provider {
            "openai" => Ok(self
                .config
                .openai_base_url
                .as_deref()
                .unwrap_or(DEFAULT_OPENAI_BASE_URL)),
            "openrouter" => Ok(self
                .config
                .openrouter_base_url
                .as_deref()
                .unwrap_or(DEFAULT_OPENROUTER_BASE_URL)),
            "deepseek" => Ok(self
                .config
                .deepseek_base_url
                .as_deref()
                .unwrap_or(DEFAULT_DEEPSEEK_BASE_URL)),
            "mistral" => Ok(self
                .config
                .mistral_base_url
                .as_deref()
                .unwrap_or(DEFAULT_MISTRAL_BASE_URL)),
            _ => Err(LlmError::UnknownProvider(provider.into())),
        }
    }

    /// Get the HTTP client.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Resolve a model selector to provider and model components.
    /// Format: "provider/model-name" or just "model-name" (defaults to openai).
    pub fn resolve_model(&self, selector: &str) -> (String, String) {
        if let Some((provider, model)) = selector.split_once('/') {
            (provider.to_string(), model.to_string())
        } else {
            ("openai".into(), selector.to_string())
        }
    }
}
