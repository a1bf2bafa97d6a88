// =============================================================================
// Retry helper shared by every REST call: exponential backoff with +/-20%
// jitter, base 250ms, cap 8s, max 5 attempts. Retries on NetworkTransient and
// 5xx; fails fast on 4xx.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use tracing::warn;

const BASE: Duration = Duration::from_millis(250);
const CAP: Duration = Duration::from_secs(8);
const MAX_ATTEMPTS: u32 = 5;

/// Whether an HTTP status should be retried (5xx, or treated as transient)
/// versus failed fast (4xx).
pub fn is_retriable_status(status: u16) -> bool {
    status >= 500 || status == 429
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(CAP.as_millis() as u64);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = (capped as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Outcome an attempt can report to the retry driver.
pub enum AttemptOutcome<T> {
    Success(T),
    /// Retry with backoff (NetworkTransient / 5xx).
    Retry(anyhow::Error),
    /// Fail immediately, no further attempts (4xx / fatal).
    FailFast(anyhow::Error),
}

/// Drive `attempt` up to `MAX_ATTEMPTS` times with jittered exponential
/// backoff between retriable failures.
pub async fn with_retry<T, F, Fut>(operation: &str, mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AttemptOutcome<T>>,
{
    let mut last_err: Option<anyhow::Error> = None;
    for n in 0..MAX_ATTEMPTS {
        match attempt().await {
            AttemptOutcome::Success(v) => return Ok(v),
            AttemptOutcome::FailFast(e) => return Err(e),
            AttemptOutcome::Retry(e) => {
                let delay = backoff_delay(n);
                warn!(operation, attempt = n + 1, max_attempts = MAX_ATTEMPTS, delay_ms = delay.as_millis() as u64, error = %e, "retriable failure, backing off");
                last_err = Some(e);
                if n + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{operation} exhausted retries")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses_are_5xx_and_429() {
        assert!(is_retriable_status(500));
        assert!(is_retriable_status(503));
        assert!(is_retriable_status(429));
        assert!(!is_retriable_status(400));
        assert!(!is_retriable_status(404));
    }

    #[test]
    fn backoff_delay_is_capped_and_nonnegative() {
        for attempt in 0..10 {
            let d = backoff_delay(attempt);
            assert!(d.as_millis() <= (CAP.as_millis() as f64 * 1.2) as u128);
        }
    }

    #[tokio::test]
    async fn with_retry_returns_success_without_retrying() {
        let mut calls = 0;
        let result: anyhow::Result<u32> = with_retry("test", || {
            calls += 1;
            async { AttemptOutcome::Success(42u32) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_retry_fails_fast_without_retrying() {
        let mut calls = 0;
        let result: anyhow::Result<u32> = with_retry("test", || {
            calls += 1;
            async { AttemptOutcome::FailFast(anyhow::anyhow!("bad request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
