//! Engine configuration.

/// Provider credentials and endpoint overrides for the built-in model client.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub openai_key: Option<String>,
    pub openrouter_key: Option<String>,
    pub deepseek_key: Option<String>,
    pub mistral_key: Option<String>,

    pub openai_base_url: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub deepseek_base_url: Option<String>,
    pub mistral_base_url: Option<String>,
}

impl LlmConfig {
    /// Read provider keys from the environment. Missing keys are fine —
    /// they only matter once a profile routes to that provider.
    pub fn from_env() -> Self {
        Self {
            openai_key: std::env::var("OPENAI_API_KEY").ok(),
            openrouter_key: std::env::var("OPENROUTER_API_KEY").ok(),
            deepseek_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            mistral_key: std::env::var("MISTRAL_API_KEY").ok(),
            ..Self::default()
        }
    }
}

/// Tunables for history resolution and context assembly.
#[derive(Debug, Clone, Copy)]
pub struct EngineTunables {
    /// How many trailing messages of the active path are sent to the model.
    pub context_depth: i64,
    /// Default page size for `list_messages`.
    pub default_page_limit: i64,
}

impl Default for EngineTunables {
    fn default() -> Self {
        Self {
            context_depth: 10,
            default_page_limit: 10,
        }
    }
}
