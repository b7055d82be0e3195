//! The single retry loop shared by every remote call.
//!
//! Both extractors used to carry their own copy of "acquire, call, classify,
//! sleep, repeat". They are expressed here once, parameterised by a
//! classifier (which [`RetryClass`] a failure belongs to) and a
//! [`BackoffPolicy`].

use super::backoff::{BackoffPolicy, RetryClass};
use super::rate::RateLimiter;
use std::fmt;
use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Every attempt failed, or a failure was classified [`RetryClass::Stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    /// Attempts made, including the first.
    pub attempts: u32,
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.last)
    }
}

/// Run `op` until it succeeds, at most `max_retries + 1` times.
///
/// The limiter is acquired before every attempt. `op` receives the 0-based
/// attempt index so callers can vary the request (e.g. raise temperature).
/// No sleep follows the final attempt.
pub async fn retry_call<T, E, F, Fut, C>(
    label: &str,
    max_retries: u32,
    policy: &BackoffPolicy,
    limiter: &RateLimiter,
    classify: C,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        limiter.acquire().await;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{}: succeeded on attempt {}", label, attempt + 1);
                }
                return Ok(value);
            }
            Err(err) => {
                let class = classify(&err);
                if class == RetryClass::Stop || attempt >= max_retries {
                    warn!(
                        "{}: giving up after attempt {}/{}: {}",
                        label,
                        attempt + 1,
                        max_retries + 1,
                        err
                    );
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                let wait = policy.delay(attempt, class);
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:.1}s",
                    label,
                    attempt + 1,
                    max_retries + 1,
                    err,
                    wait.as_secs_f64()
                );
                sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::{Duration, Instant};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(3),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.0,
            quick_delay: Duration::from_secs(1),
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(1000, Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let start = Instant::now();
        let out = retry_call(
            "test",
            5,
            &policy(),
            &limiter(),
            |_: &String| RetryClass::Backoff,
            |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt < 2 {
                        Err(format!("503 on attempt {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.get(), 3);
        // 3s + 6s of backoff with jitter disabled.
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget() {
        let calls = Cell::new(0u32);
        let out: Result<(), _> = retry_call(
            "test",
            2,
            &policy(),
            &limiter(),
            |_: &String| RetryClass::Quick,
            |_| {
                calls.set(calls.get() + 1);
                async { Err("bad json".to_string()) }
            },
        )
        .await;
        let err = out.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "bad json");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_class_is_not_retried() {
        let calls = Cell::new(0u32);
        let start = Instant::now();
        let out: Result<(), _> = retry_call(
            "test",
            5,
            &policy(),
            &limiter(),
            |_: &String| RetryClass::Stop,
            |_| {
                calls.set(calls.get() + 1);
                async { Err("401 unauthorized".to_string()) }
            },
        )
        .await;
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(Instant::now(), start);
    }
}
