use serde::{Deserialize, Serialize};

/// An OpenAI-compatible chat-completions endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub model: String,
    /// Name of the env var holding the API key. Keys never live in the file.
    pub api_key_env: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub context_window: usize,
    pub request_timeout_ms: u64,
}

impl ModelEndpoint {
    fn with_model(model: &str, max_tokens: u32, temperature: f64) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature,
            max_tokens,
            context_window: 128_000,
            request_timeout_ms: 120_000,
        }
    }
}

impl Default for ModelEndpoint {
    fn default() -> Self {
        Self::with_model("gpt-4o-mini", 1024, 0.0)
    }
}

/// Fast tier serves boundary decisions; accurate tier serves summaries and
/// chunk analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub fast: ModelEndpoint,
    pub accurate: ModelEndpoint,
    /// Extra fast-tier models on the same endpoint. When non-empty, decision
    /// calls rotate across `fast.model` and these.
    pub rotation: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            fast: ModelEndpoint::with_model("gpt-4o-mini", 512, 0.0),
            accurate: ModelEndpoint::with_model("gpt-4o", 1024, 0.2),
            rotation: Vec::new(),
        }
    }
}
