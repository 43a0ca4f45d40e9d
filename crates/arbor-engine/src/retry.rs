use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use arbor_core::errors::GatewayError;
use arbor_core::provider::{CallOptions, CompletionRequest, LlmProvider};
use arbor_store::StoreError;

/// `base * 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
}

fn worth_retrying(e: &GatewayError) -> bool {
    e.is_retryable() || matches!(e, GatewayError::Timeout(_))
}

/// One external call under a deadline, racing cancellation. Retryable
/// failures and timeouts are retried up to `options.retries` times with
/// exponential backoff.
pub async fn complete_with_policy(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    options: &CallOptions,
    cancel: &CancellationToken,
) -> Result<String, GatewayError> {
    let mut attempt = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = tokio::time::timeout(options.timeout, provider.complete(request)) => r,
        };
        let err = match outcome {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => e,
            Err(_) => GatewayError::Timeout(options.timeout),
        };
        if !worth_retrying(&err) || attempt >= options.retries {
            return Err(err);
        }

        let delay = err
            .suggested_delay()
            .unwrap_or_else(|| backoff_delay(options.backoff, attempt));
        warn!(
            attempt = attempt + 1,
            max_retries = options.retries,
            delay_ms = delay.as_millis() as u64,
            model = provider.model(),
            error = %err,
            "external call failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Retry a store write while SQLite reports BUSY/LOCKED.
pub async fn persist_with_retry<T, F>(
    what: &str,
    retries: u32,
    backoff: Duration,
    mut write: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 0;
    loop {
        match write() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < retries => {
                let delay = backoff_delay(backoff, attempt);
                warn!(attempt = attempt + 1, what, error = %e, "store busy, retrying write");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
