use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Which backend class a call should be routed to. Boundary decisions are
/// latency-sensitive and go to the fast tier; summaries and chunk analysis
/// go to the accurate tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Accurate,
}

/// One text-in, text-out request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Ask the backend for a JSON object response when it supports it.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            json_mode: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Options applied around a completion call by the caller, not the backend.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 0,
            backoff: Duration::from_millis(500),
        }
    }
}

/// The external capability every model-backed collaborator is reached
/// through. Implementations hold no engine logic.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn context_window(&self) -> usize;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError>;
}

#[async_trait]
impl<P: LlmProvider + ?Sized> LlmProvider for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    fn context_window(&self) -> usize {
        (**self).context_window()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        (**self).complete(request).await
    }
}
