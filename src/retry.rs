//! Retry policy shared by the merge, upload and store-update steps.
//!
//! Every retry budget is per-step, not per-booking: a step gets `max`
//! attempts with exponential backoff, and the deferred-retry queue layers
//! its own schedule on top for network outages.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max.max(1),
            base_backoff: Duration::from_secs(config.backoff_secs.max(1)),
        }
    }

    /// Deterministic exponential backoff for attempt `n` (0-based),
    /// capped at one hour.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        self.base_backoff
            .saturating_mul(factor as u32)
            .min(Duration::from_secs(3600))
    }

    /// Backoff with up to 25% random jitter, so a fleet of deferred
    /// retries does not stampede the store when the network returns.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping the backoff between
/// failures. The last error is returned when the budget is exhausted.
pub async fn retry_async<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    "{what} failed ({e}); retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max,
            base_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
        };
        assert_eq!(p.backoff(0), Duration::from_secs(2));
        assert_eq!(p.backoff(1), Duration::from_secs(4));
        assert_eq!(p.backoff(2), Duration::from_secs(8));
        assert_eq!(p.backoff(30), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let p = policy(3);
        for attempt in 0..4 {
            let base = p.backoff(attempt);
            let jittered = p.backoff_with_jitter(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 4 + Duration::from_millis(1));
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_async(policy(3), "test op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_async(policy(3), "test op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent".to_string()) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
