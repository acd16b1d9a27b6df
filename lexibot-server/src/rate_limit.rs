//! Sliding-window rate limiter for outbound API calls.
//!
//! One limiter instance exists per external dependency (message platform,
//! generative backend), each with its own limit. Denial is a retryable
//! signal: callers surface [`RateLimited`] instead of dropping the request.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Typed marker error for a denied acquisition.
///
/// Surfaced through `anyhow` so the webhook layer can downcast it and map it
/// to a rate-limited HTTP status without marking the event processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limit exceeded, retry after {:.1}s",
            self.retry_after.as_secs_f64()
        )
    }
}

impl std::error::Error for RateLimited {}

/// Sliding-window counter over granted-acquisition timestamps.
pub struct RateLimiter {
    grants: Mutex<Vec<Instant>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        assert!(limit > 0, "rate limit must be nonzero");
        Self {
            grants: Mutex::new(Vec::new()),
            limit,
            window,
        }
    }

    /// Grant an acquisition if fewer than `limit` grants fall inside the
    /// trailing window.
    pub fn try_acquire(&self) -> bool {
        let mut grants = self.grants.lock().expect("mutex poisoned");
        let now = Instant::now();
        grants.retain(|granted| now.duration_since(*granted) < self.window);

        if grants.len() < self.limit {
            grants.push(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest in-window grant exits the window.
    ///
    /// Zero when an acquisition would currently be granted.
    pub fn time_until_next_slot(&self) -> Duration {
        let mut grants = self.grants.lock().expect("mutex poisoned");
        let now = Instant::now();
        grants.retain(|granted| now.duration_since(*granted) < self.window);

        if grants.len() < self.limit {
            return Duration::ZERO;
        }

        let oldest = grants.iter().min().expect("nonempty at limit");
        self.window.saturating_sub(now.duration_since(*oldest))
    }

    /// Acquire or return the typed denial error.
    pub fn acquire(&self) -> Result<(), RateLimited> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(RateLimited {
                retry_after: self.time_until_next_slot(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn wait_time_is_zero_under_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.time_until_next_slot(), Duration::ZERO);
        limiter.try_acquire();
        assert_eq!(limiter.time_until_next_slot(), Duration::ZERO);
    }

    #[test]
    fn wait_time_reported_when_saturated() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        let wait = limiter.time_until_next_slot();
        assert!(wait > Duration::from_secs(50));
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn acquire_returns_typed_denial() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.acquire().is_ok());
        let err = limiter.acquire().expect_err("should be denied");
        assert!(err.retry_after > Duration::ZERO);
    }
}
