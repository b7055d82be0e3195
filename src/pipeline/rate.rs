//! Client-side rate limiting against the remote quota.
//!
//! Free-tier quotas are enforced per rolling minute. Staying under them on
//! the client is far cheaper than collecting 429s and backing off, so every
//! remote call goes through [`RateLimiter::acquire`] first.

use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter: at most `max_per_minute` calls in any 60 s window
/// and at least `min_delay` between consecutive calls.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_minute: usize,
    min_delay: Duration,
    history: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize, min_delay: Duration) -> Self {
        let max_per_minute = max_per_minute.max(1);
        Self {
            max_per_minute,
            min_delay,
            history: Mutex::new(VecDeque::with_capacity(max_per_minute)),
        }
    }

    /// Wait until another call is allowed, then record it.
    ///
    /// The lock is held across the wait so concurrent callers queue up
    /// behind each other instead of all waking at the same instant.
    pub async fn acquire(&self) {
        let mut history = self.history.lock().await;
        loop {
            let now = Instant::now();
            while history
                .front()
                .is_some_and(|&t| now.duration_since(t) >= WINDOW)
            {
                history.pop_front();
            }
            if history.len() < self.max_per_minute {
                break;
            }
            if let Some(&oldest) = history.front() {
                let until = oldest + WINDOW;
                debug!(
                    "Rate limit reached ({} calls/min), waiting {:?}",
                    self.max_per_minute,
                    until.saturating_duration_since(now)
                );
                sleep_until(until).await;
            }
        }

        if let Some(&last) = history.back() {
            let ready = last + self.min_delay;
            if ready > Instant::now() {
                sleep_until(ready).await;
            }
        }

        history.push_back(Instant::now());
        if history.len() > self.max_per_minute {
            history.pop_front();
        }
    }

    /// Calls recorded in the current window.
    pub async fn recent_calls(&self) -> usize {
        let now = Instant::now();
        self.history
            .lock()
            .await
            .iter()
            .filter(|&&t| now.duration_since(t) < WINDOW)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_in_any_window() {
        let limiter = RateLimiter::new(3, Duration::ZERO);
        let mut stamps = Vec::new();
        for _ in 0..10 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }
        for (i, &t) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|&&u| u.duration_since(t) < WINDOW)
                .count();
            assert!(in_window <= 3, "{in_window} calls within 60s of call {i}");
        }
        // 10 calls at 3/min need at least three full windows.
        assert!(stamps[9].duration_since(stamps[0]) >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_spacing() {
        let limiter = RateLimiter::new(100, Duration::from_millis(4500));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(9000));
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_is_immediate() {
        let limiter = RateLimiter::new(15, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.recent_calls().await, 1);
    }
}
