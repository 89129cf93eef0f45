//! Bounded exponential-backoff retry for external calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use autoeval_types::Result;

/// Retry policy for agent and collaborator calls.
///
/// `max_attempts` counts total tries, not retries. Error classes are not
/// distinguished here; callers decide what is worth wrapping.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter: f64,
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Used in tests and dry runs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Backoff before the retry that follows failed `attempt` (1-indexed):
    /// `base_delay * 2^(attempt - 1)`, without jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay.saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Backoff plus a uniform draw from `[0, jitter * backoff)`.
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let max_extra = delay.as_secs_f64() * self.jitter;
        if max_extra <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..max_extra);
        delay + Duration::from_secs_f64(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: 0.3,
        }
    }
}

/// Call `f` until it succeeds or `policy.max_attempts` tries are used up.
///
/// The error from the final attempt is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                tracing::warn!(call = %label, attempts, error = %e, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.jittered_delay(attempt);
                tracing::info!(
                    call = %label,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Call failed, retrying"
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
    use autoeval_types::AutoevalError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 1. Success on first try makes exactly one call
    #[tokio::test]
    async fn success_on_first_try() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "summarizer", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AutoevalError>("done")
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // 2. Transient failure recovers on the second try
    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "judge", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(AutoevalError::agent("judge", "malformed output"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // 3. Always-failing call runs exactly max_attempts times and surfaces the last error
    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(3), "author", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(AutoevalError::agent("author", format!("attempt {n} failed")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Agent 'author' failed: attempt 3 failed"
        );
    }

    // 4. Zero attempts still tries once
    #[tokio::test]
    async fn zero_attempts_tries_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(0), "x", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AutoevalError::Other("nope".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // 5. Backoff doubles from the base delay
    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.jittered_delay(2), Duration::from_millis(2000));
    }

    // 6. Jitter stays within its fraction of the backoff
    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.jittered_delay(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_millis(2600));
        }
    }

    // 7. Sleeps between attempts follow the backoff schedule
    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            jitter: 0.0,
        };
        let started = tokio::time::Instant::now();
        let result: Result<()> = with_retry(&policy, "x", || async {
            Err(AutoevalError::Other("down".into()))
        })
        .await;

        assert!(result.is_err());
        // 100ms after the first failure, 200ms after the second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(310), "{elapsed:?}");
    }
}
