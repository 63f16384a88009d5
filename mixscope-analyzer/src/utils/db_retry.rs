//! Retry with exponential backoff
//!
//! SQLite reports lock contention as an ordinary error; queue transports fail transiently.
//! Both are retried here with the same schedule: 10 ms initial delay, doubling, capped at
//! 1000 ms, until a total wait budget is spent.

use std::future::Future;
use std::time::{Duration, Instant};

use mixscope_common::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry `operation` while `is_retryable` accepts its error and `max_wait` has not elapsed.
///
/// Returns the last error once the budget is exhausted. Non-retryable errors are returned
/// immediately.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    operation_name: &str,
    max_wait: Duration,
    is_retryable: P,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let start_time = Instant::now();
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_wait {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms = max_wait.as_millis(),
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err);
                }

                let delay = Duration::from_millis(backoff_ms).min(max_wait - elapsed);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis(),
                    remaining_ms = max_wait.saturating_sub(elapsed).as_millis(),
                    error = %err,
                    "Transient failure, will retry after backoff"
                );

                tokio::time::sleep(delay).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Retry a database operation while SQLite reports lock contention.
///
/// On exhaustion the lock error is replaced by an `Internal` error naming the operation.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    match retry_with_backoff(
        operation_name,
        Duration::from_millis(max_wait_ms),
        Error::is_lock_contention,
        operation,
    )
    .await
    {
        Err(err) if err.is_lock_contention() => Err(Error::Internal(format!(
            "{}: database locked after {} ms (max {} ms)",
            operation_name,
            start_time.elapsed().as_millis(),
            max_wait_ms
        ))),
        other => other,
    }
}
