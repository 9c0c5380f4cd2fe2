//! Bounded retry with backoff.
//!
//! A [`RetryPolicy`] is a plain value; the wrapped operation does not know
//! how often or how long it is retried.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Wait after every failed attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_while(what, |_| true, op).await
    }

    /// Like [`run`](Self::run), but stops early on errors `should_retry` rejects.
    pub async fn run_while<T, E, P, F, Fut>(
        &self,
        what: &str,
        should_retry: P,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(what, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < attempts && should_retry(&e) => {
                    let delay = self.backoff;
                    tracing::warn!(
                        what,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::debug!(what, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let policy = RetryPolicy::fixed(5, Duration::from_secs(6));

        let result: Result<u32, String> = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(1));
        let result: Result<(), String> = policy
            .run("always failing", |attempt| async move { Err(format!("failure {attempt}")) })
            .await;
        assert_eq!(result, Err("failure 4".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_while_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1));
        let result: Result<(), &str> = policy
            .run_while(
                "permanent",
                |e| *e != "permanent",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("permanent") }
                },
            )
            .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let result: Result<u8, String> = policy.run("once", |_| async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(policy.attempts(), 1);
    }
}
