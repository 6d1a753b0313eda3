//! Bounded exponential retry with jitter
//!
//! Storage backends surface serialization conflicts as transient errors;
//! this utility retries them with exponential backoff and ±25% jitter,
//! bounded by attempt count. A `Permanent` wrapper short-circuits the loop
//! for errors that retrying cannot fix.

use std::future::Future;
use std::time::Duration;

use log::debug;
use rand::Rng;

/// How an operation's failure should be treated by [`retry_with_backoff`]
#[derive(Debug)]
pub enum RetryError<E> {
    /// Worth another attempt (serialization conflict, transient I/O)
    Transient(E),
    /// Retrying cannot help; stop immediately
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Transient(e) | RetryError::Permanent(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

// ±25% around the nominal delay
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

/// Run `op` until it succeeds, returns a permanent error, or the attempt
/// budget is spent. The last transient error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(err),
            Err(RetryError::Transient(err)) => {
                if attempt == attempts {
                    return Err(err);
                }
                let sleep_for = jittered(delay);
                debug!(
                    "transient failure (attempt {}/{}), retrying in {:?}",
                    attempt, attempts, sleep_for
                );
                tokio::time::sleep(sleep_for).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }

    unreachable!("retry loop returns within the attempt budget")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result: Result<u32, &str> =
            retry_with_backoff(RetryPolicy::immediate(3), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(RetryPolicy::immediate(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetryError::Transient("conflict"))
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
    async fn test_permanent_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(RetryPolicy::immediate(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Permanent("broken")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "broken");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(RetryPolicy::immediate(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetryError::Transient("conflict")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "conflict");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let nominal = Duration::from_millis(100);
        for _ in 0..64 {
            let d = jittered(nominal);
            assert!(d >= Duration::from_millis(75));
            assert!(d <= Duration::from_millis(125));
        }
    }
}
