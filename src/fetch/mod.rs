//! Network side of the cache: transport, deduplication and retries.

mod dedupe;
mod retry;
mod transport;

pub use dedupe::{Deduplicator, FetchResult, SharedFetch};
pub use retry::RetryPolicy;
pub use transport::{ApiRequest, HttpTransport, Method, TokenRefresher, Transport};

use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;

/// Send `request` once, bounded by `timeout`.
pub async fn send_once(
  transport: &dyn Transport,
  request: &ApiRequest,
  timeout: Duration,
) -> Result<Value, ApiError> {
  match tokio::time::timeout(timeout, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(ApiError::timeout(timeout)),
  }
}

/// Send `request`, retrying per `policy` with backoff between attempts.
pub async fn send_with_retry(
  transport: &dyn Transport,
  request: &ApiRequest,
  policy: &RetryPolicy,
  timeout: Duration,
) -> Result<Value, ApiError> {
  let mut attempt = 0;
  loop {
    match send_once(transport, request, timeout).await {
      Ok(value) => return Ok(value),
      Err(err) if policy.should_retry(attempt, &err) => {
        let delay = policy.delay_for(attempt);
        warn!(
          path = %request.path,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "retrying request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(err) => return Err(err),
    }
  }
}
