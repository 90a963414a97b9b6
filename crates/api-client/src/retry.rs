//! Exponential-backoff retry with error classification.
//!
//! Transient exchange conditions (timestamp skew, rate limiting, cancel
//! bursts) and network failures are retried; anything the exchange will
//! keep rejecting (bad balance, bad order, bad credential) is not.

use crate::error::ApiError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after backoff.
    Transient,
    /// Retry after backoff, but resynchronise the server clock first.
    TimestampSkew,
    /// Do not retry; propagate to the caller.
    Permanent,
}

/// Classifies an API error for the retry policy.
pub fn classify(err: &ApiError) -> ErrorClass {
    match err {
        ApiError::Network(_) => ErrorClass::Transient,
        ApiError::InsufficientBalance(_) | ApiError::InvalidOrder(_) => ErrorClass::Permanent,
        ApiError::Exchange(code, _) => match code {
            // Timestamp outside of recvWindow.
            -1021 => ErrorClass::TimestampSkew,
            // Too many requests / cancel-replace too frequent.
            -1003 | -1015 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        _ => ErrorClass::Permanent,
    }
}

/// Runs `op` up to `1 + max_retries` times with exponential backoff.
///
/// `on_skew` runs before the retry whenever the failure was a timestamp
/// skew, giving the caller a chance to resynchronise its clock.
pub async fn retry_with<T, F, Fut, S, SFut>(
    max_retries: u32,
    base_delay: Duration,
    op: F,
    mut on_skew: S,
) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    S: FnMut() -> SFut,
    SFut: Future<Output = ()>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                if class == ErrorClass::Permanent || attempt >= max_retries {
                    return Err(err);
                }
                if class == ErrorClass::TimestampSkew {
                    tracing::warn!(error = %err, "timestamp skew, resyncing clock before retry");
                    on_skew().await;
                }
                let delay = base_delay * 2u32.pow(attempt);
                tracing::warn!(
                    error = %err,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient API error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn insufficient_balance_is_permanent() {
        let err = crate::error::map_exchange_error(-2010, "no funds".into());
        assert_eq!(classify(&err), ErrorClass::Permanent);
    }

    #[test]
    fn timestamp_skew_is_classified() {
        let err = ApiError::Exchange(-1021, "timestamp outside recvWindow".into());
        assert_eq!(classify(&err), ErrorClass::TimestampSkew);
    }

    #[test]
    fn rate_limit_and_network_are_transient() {
        assert_eq!(
            classify(&ApiError::Exchange(-1003, "too many requests".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ApiError::Network("connection reset".into())),
            ErrorClass::Transient
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_never_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), ApiError> = retry_with(
            3,
            Duration::from_secs(1),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::map_exchange_error(-2010, "no funds".into()))
            },
            || async {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skew_invokes_resync_then_retries() {
        let attempts = AtomicU32::new(0);
        let resyncs = AtomicU32::new(0);
        let result = retry_with(
            3,
            Duration::from_secs(1),
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::Exchange(-1021, "skew".into()))
                } else {
                    Ok(42)
                }
            },
            || async {
                resyncs.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_retry_budget() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), ApiError> = retry_with(
            2,
            Duration::from_millis(100),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::Network("timeout".into()))
            },
            || async {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
