use std::future::Future;
use std::time::Duration;

use tracing::warn;

use flowmill_core::config::RetryConfig;
use flowmill_core::error::Result;

/// Exponential backoff for the given zero-based attempt, capped and jittered.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `op` up to `retries + 1` times, backing off between handler failures.
///
/// Only handler failures and timeouts are retried; any other error returns
/// immediately.
pub async fn with_retries<F, Fut, T>(
    label: &str,
    retries: u32,
    config: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_handler_failure() && attempt < retries => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    handler = label,
                    attempt = attempt + 1,
                    max_retries = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying handler"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmill_core::error::FlowError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let third = calculate_backoff(2, &config).as_millis();
        assert!((320..=480).contains(&third));
        let capped = calculate_backoff(30, &config).as_millis();
        assert!(capped <= 1200);
    }

    #[tokio::test]
    async fn test_retries_handler_failures_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_retries("flaky", 3, &fast(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FlowError::handler("flaky", "not yet"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let err = with_retries("down", 2, &fast(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FlowError::handler("down", "503")) }
        })
        .await
        .unwrap_err();
        assert!(err.is_handler_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = with_retries("bad", 5, &fast(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FlowError::Validation("nope".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
