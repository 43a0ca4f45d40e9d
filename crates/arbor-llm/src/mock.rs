use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use arbor_core::errors::GatewayError;
use arbor_core::provider::{CompletionRequest, LlmProvider};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this text.
    Text(String),
    /// Fail the call.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(request.prompt.clone());

        match self.responses.get(idx) {
            Some(response) => resolve_response(response).await,
            None => Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            ))),
        }
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: &MockResponse) -> Result<String, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Text(text) => return Ok(text.clone()),
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}

type Responder = dyn Fn(&CompletionRequest, usize) -> MockResponse + Send + Sync;

/// Provider whose response is computed from the request. Useful when the
/// number or order of calls isn't known up front (e.g. concurrent
/// summaries).
pub struct ScriptedProvider {
    responder: Box<Responder>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    /// `responder` receives the request and the zero-based call index.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> MockResponse + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = (self.responder)(request, idx);
        resolve_response(&response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::text("hello world")]);
        let out = mock.complete(&CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(mock.prompts(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock.complete(&CompletionRequest::new("hi")).await;
        assert!(matches!(result, Err(GatewayError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn sequential_responses_then_exhausted() {
        let mock = MockProvider::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        let req = CompletionRequest::new("x");
        assert_eq!(mock.complete(&req).await.unwrap(), "first");
        assert_eq!(mock.complete(&req).await.unwrap(), "second");
        assert!(matches!(
            mock.complete(&req).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(10),
            MockResponse::delayed(Duration::from_secs(5), MockResponse::text("late")),
        )]);
        let start = tokio::time::Instant::now();
        let out = mock.complete(&CompletionRequest::new("x")).await.unwrap();
        assert_eq!(out, "late");
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn scripted_provider_sees_request() {
        let provider = ScriptedProvider::new(|req, idx| {
            MockResponse::text(format!("{idx}:{}", req.prompt.len()))
        });
        assert_eq!(provider.complete(&CompletionRequest::new("abc")).await.unwrap(), "0:3");
        assert_eq!(provider.complete(&CompletionRequest::new("abcd")).await.unwrap(), "1:4");
        assert_eq!(provider.call_count(), 2);
    }
}
