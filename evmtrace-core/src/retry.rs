use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Upper bound on any single wait between attempts
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Retry an async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `max_retries` - Maximum number of retry attempts (0 = single attempt)
/// * `base_delay` - Delay before the first retry, doubled on each further retry
/// * `max_delay` - Cap on the delay between retries
///
/// # Returns
/// The first successful result, or the error of the final attempt
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: F,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                let delay = std::cmp::min(base_delay.saturating_mul(2u32.saturating_pow(attempt)), max_delay);

                warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    delay
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Whether an error message looks like a provider throttling response
pub fn is_rate_limit_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit")
        || message.contains("429")
        || message.contains("too many requests")
        || message.contains("limit exceeded")
}

/// Retry an operation that might be throttled by the RPC provider
///
/// Throttling errors wait `5s * attempt`, anything else backs off from 100ms.
pub async fn retry_with_rate_limit<T, E, F, Fut>(operation: F, max_retries: u32) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_retries => return Err(e),
            Err(e) => {
                let is_rate_limit = is_rate_limit_error(&e.to_string());

                let delay = if is_rate_limit {
                    Duration::from_secs((attempt as u64 + 1) * 5)
                } else {
                    Duration::from_millis(100u64.saturating_mul(2u64.saturating_pow(attempt)))
                };
                let delay = std::cmp::min(delay, MAX_RATE_LIMIT_DELAY);

                if is_rate_limit {
                    warn!(
                        "Rate limit hit (attempt {}/{}). Waiting {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        delay
                    );
                } else {
                    debug!(
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                }

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
