//! Retry with exponential backoff, and transient-error classification

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff: `base * 2^(attempt-1)` (base, 2x base, 4x base, ...)
pub fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Retry an async operation while `retryable` accepts the error, up to
/// `max_attempts` calls in total.
///
/// Returns the first success, or the last error on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    max_attempts: u32,
    base: Duration,
    retryable: impl Fn(&E) -> bool,
    mut attempt_fn: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                debug!("{label}: attempt {attempt}/{max_attempts} failed: {e}, retrying...");
                tokio::time::sleep(backoff_duration(base, attempt)).await;
            }
            Err(e) => {
                warn!("{label}: giving up after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}

/// Error-text fragments that mark a failure as transient
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
    "timed out",
    "timeout",
    "error decoding response body",
    "unexpected eof",
    "incomplete message",
    "socket hang up",
    "econnreset",
    "http 502",
    "http 503",
    "http 504",
];

/// Whether an error message describes a network or stream hiccup
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_exponential() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_duration(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_duration(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_duration(base, 3), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = retry_with_backoff(
            "signed url",
            3,
            Duration::from_millis(1),
            |_| true,
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_with_backoff(
            "signed url",
            5,
            Duration::from_millis(1),
            |e: &String| !e.contains("403"),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("HTTP 403".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_with_backoff(
            "signed url",
            3,
            Duration::from_millis(1),
            |_| true,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("connection reset".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_transient_patterns() {
        assert!(is_transient_message("error decoding response body: connection reset by peer"));
        assert!(is_transient_message("operation timed out"));
        assert!(is_transient_message("download failed with HTTP 503: upstream"));
        assert!(!is_transient_message("download failed with HTTP 403: forbidden"));
        assert!(!is_transient_message("duplicate key value violates unique constraint"));
    }
}
