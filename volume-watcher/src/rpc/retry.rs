use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{Result, WatcherError};
use crate::metrics;

/// Execute an async operation with exponential backoff retry.
///
/// Retries up to `policy.max_attempts` total attempts for retryable errors.
/// Cancellation interrupts the backoff and returns `Cancelled`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !err.is_retryable() || attempt >= policy.max_attempts {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed after retries"
                        );
                    }
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retryable error, backing off"
                );

                metrics::record_retry(operation_name);

                tokio::select! {
                    _ = cancel.cancelled() => return Err(WatcherError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
