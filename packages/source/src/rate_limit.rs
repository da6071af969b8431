//! Global request spacing.
//!
//! One [`RateLimiter`] is shared (via `Arc`) by every fetcher talking to the
//! same API, so the limit holds across all datasets and workers rather than
//! per dataset.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Enforces a minimum interval between request starts.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing one request start per `min_interval`.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Creates a limiter allowing `requests_per_second` request starts per
    /// second. Non-positive or non-finite rates disable limiting.
    #[must_use]
    pub fn per_second(requests_per_second: f64) -> Self {
        if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Self::new(Duration::from_secs_f64(1.0 / requests_per_second))
        } else {
            Self::unlimited()
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Minimum spacing between request starts.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until this caller may start a request.
    ///
    /// Slots are handed out in call order; the lock is only held while a
    /// slot is reserved, never while waiting for it.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = {
            let now = Instant::now();
            let mut next = match self.next_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.min_interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_sequential_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(450), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_requests_across_tasks() {
        let limiter = Arc::new(RateLimiter::per_second(10.0));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap() - start);
        }
        starts.sort();

        for (i, offset) in (0_u64..).zip(&starts) {
            let expected = Duration::from_millis(100 * i);
            assert!(*offset >= expected, "request {i} started at {offset:?}");
            assert!(*offset < expected + Duration::from_millis(50), "request {i} started at {offset:?}");
        }
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::per_second(0.0);
        assert!(limiter.min_interval().is_zero());
        let start = std::time::Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
