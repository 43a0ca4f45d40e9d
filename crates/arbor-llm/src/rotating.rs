use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use arbor_core::errors::GatewayError;
use arbor_core::provider::{CompletionRequest, LlmProvider};

/// Spreads calls round-robin across several providers, e.g. multiple
/// fast-tier models behind one endpoint.
pub struct RotatingProvider {
    providers: Vec<Arc<dyn LlmProvider>>,
    next: AtomicUsize,
}

impl RotatingProvider {
    /// Returns `None` when `providers` is empty.
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Option<Self> {
        if providers.is_empty() {
            return None;
        }
        Some(Self {
            providers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn pick(&self) -> &Arc<dyn LlmProvider> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.providers.len();
        &self.providers[idx]
    }
}

#[async_trait]
impl LlmProvider for RotatingProvider {
    fn name(&self) -> &str {
        "rotating"
    }

    fn model(&self) -> &str {
        self.providers[0].model()
    }

    /// The smallest window of the rotation, since any member may serve a call.
    fn context_window(&self) -> usize {
        self.providers
            .iter()
            .map(|p| p.context_window())
            .min()
            .unwrap_or(0)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let provider = self.pick();
        debug!(model = provider.model(), "rotating provider selected model");
        provider.complete(request).await
    }
}
